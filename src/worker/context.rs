//! Per-iteration task state.
//!
//! Everything a task attempt accumulates lives here instead of on the worker
//! itself, so nothing leaks between iterations. The scratch directory is a
//! `TempDir`: dropping the context removes it on every exit path, including
//! panics unwinding through the loop.

use std::fmt::Display;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempDir;
use tracing::debug;

/// Coarse lifecycle of one task attempt, for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Claimed,
    FetchingAudio,
    Running,
    StreamingResults,
    Completing,
    Done,
    Failed,
}

impl Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One progress report, kept for the completion payload.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEntry {
    pub step: String,
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

pub struct TaskContext {
    scratch: TempDir,
    phase: TaskPhase,
    progress_log: Vec<ProgressEntry>,
}

impl TaskContext {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            scratch: TempDir::new()?,
            phase: TaskPhase::Claimed,
            progress_log: Vec::new(),
        })
    }

    /// Scratch directory for this attempt only.
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: TaskPhase) {
        debug!(from = %self.phase, to = %phase, "task phase transition");
        self.phase = phase;
    }

    pub fn record_progress(
        &mut self,
        step: &str,
        progress: Option<f64>,
        extra_data: Option<serde_json::Value>,
    ) {
        self.progress_log.push(ProgressEntry {
            step: step.to_string(),
            progress,
            extra_data,
            timestamp: Utc::now(),
        });
    }

    pub fn progress_log(&self) -> &[ProgressEntry] {
        &self.progress_log
    }

    /// Assembles the payload for the completion report: the accumulated
    /// progress history plus the handler's result value.
    pub fn completion_data(&self, result: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "progress": self.progress_log,
            "result": result,
        })
    }
}
