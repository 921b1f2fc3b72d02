//! Top-level poll/dispatch loop.
//!
//! One task at a time: claim, dispatch to completion or failure, report, and
//! only then claim again. The fixed poll interval on "no work" and on claim
//! failures is the only backpressure against the coordinator. Stop requests
//! are honored at iteration boundaries; a running task is never interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{Coordinator, TaskType};
use crate::worker::context::{TaskContext, TaskPhase};
use crate::worker::dispatcher::TaskDispatcher;

/// Wait between claims when the coordinator has nothing for us.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What one iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing eligible to claim (or the coordinator was unreachable).
    NoWork,
    /// A task ran and, unless in single-shot mode, was reported completed.
    Completed,
    /// A task was claimed but its attempt failed; no completion was reported
    /// and the lease will lapse server-side.
    Failed,
}

pub struct WorkerLoop {
    coordinator: Arc<dyn Coordinator>,
    dispatcher: TaskDispatcher,
    task_types: Vec<TaskType>,
    poll_interval: Duration,
    single_shot: bool,
}

impl WorkerLoop {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        dispatcher: TaskDispatcher,
        task_types: Vec<TaskType>,
    ) -> Self {
        Self {
            coordinator,
            dispatcher,
            task_types,
            poll_interval: POLL_INTERVAL,
            single_shot: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run exactly one task and exit without reporting completion. Used to
    /// exercise a worker against live data without consuming the task.
    pub fn single_shot(mut self) -> Self {
        self.single_shot = true;
        self
    }

    /// Runs until `stop` is cancelled. Task-level errors never escape.
    pub async fn run(&self, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                info!("stop requested, leaving worker loop");
                return;
            }
            match self.run_once().await {
                IterationOutcome::NoWork => {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                IterationOutcome::Completed | IterationOutcome::Failed if self.single_shot => {
                    return;
                }
                _ => {}
            }
        }
    }

    /// One iteration: claim, dispatch, report. Every failure is contained
    /// here; the scratch directory is dropped on all paths.
    pub async fn run_once(&self) -> IterationOutcome {
        let mut ctx = match TaskContext::new() {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "could not create scratch directory");
                return IterationOutcome::NoWork;
            }
        };

        let task = match self.coordinator.claim(&self.task_types).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                info!("no work available");
                return IterationOutcome::NoWork;
            }
            Err(e) if e.is_transport() => {
                warn!(error = %e, "could not reach coordinator");
                return IterationOutcome::NoWork;
            }
            Err(e) => {
                warn!(error = %e, "claim failed");
                return IterationOutcome::NoWork;
            }
        };

        match self.dispatcher.run(&task, &mut ctx).await {
            Ok(result) => {
                if self.single_shot {
                    info!(task_id = %task.id, "single-shot run done, not reporting completion");
                    ctx.set_phase(TaskPhase::Done);
                    return IterationOutcome::Completed;
                }
                let payload = ctx.completion_data(result);
                match self.coordinator.mark_completed(&task.id, payload).await {
                    Ok(()) => {
                        ctx.set_phase(TaskPhase::Done);
                        IterationOutcome::Completed
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "could not report completion");
                        ctx.set_phase(TaskPhase::Failed);
                        IterationOutcome::Failed
                    }
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "task attempt failed");
                ctx.set_phase(TaskPhase::Failed);
                IterationOutcome::Failed
            }
        }
    }
}
