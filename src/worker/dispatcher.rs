//! Routes a claimed task to its handler and drives the external engine,
//! streaming document changes as they are produced.

use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use crate::api::{
    AssignedTask, Coordinator, SpeakerIdentificationParams, TaskParams, TaskType, TranscribeParams,
};
use crate::document::{ensure_timing_invariant, CrdtDocument, DocumentReplica};
use crate::engines::{
    AlignmentEvent, DiarizationEvent, EngineSet, SpeakerOutcome, TranscriptionEvent,
};
use crate::error::{EngineError, MediaError, WorkerError};
use crate::media::{self, AudioBuffer};
use crate::sync::DocumentSync;
use crate::worker::context::{TaskContext, TaskPhase};

/// Audio window added around each paragraph handed to the aligner, seconds.
pub const PARAGRAPH_EXTEND_SECS: f64 = 0.5;

pub struct TaskDispatcher {
    coordinator: Arc<dyn Coordinator>,
    sync: Arc<dyn DocumentSync>,
    engines: EngineSet,
    http: reqwest::Client,
    /// Base for resolving relative media URLs, i.e. the coordinator root.
    media_base: Url,
}

impl TaskDispatcher {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        sync: Arc<dyn DocumentSync>,
        engines: EngineSet,
        media_base: Url,
    ) -> Self {
        Self {
            coordinator,
            sync,
            engines,
            http: reqwest::Client::new(),
            media_base,
        }
    }

    /// Runs one claimed task to completion. Returns the handler's result
    /// value for the completion report.
    pub async fn run(
        &self,
        task: &AssignedTask,
        ctx: &mut TaskContext,
    ) -> Result<serde_json::Value, WorkerError> {
        info!(task_id = %task.id, task_type = %task.task_type(), "running task");
        match &task.params {
            TaskParams::Transcribe(params) => self.transcribe(task, params, ctx).await,
            TaskParams::Align(_) => self.align(task, ctx).await,
            TaskParams::IdentifySpeakers(params) => {
                self.identify_speakers(task, params, ctx).await
            }
        }
    }

    /// Downloads and decodes the task's media. Fails fast when the document
    /// has no attachment, before any replica or sync work happens.
    async fn fetch_audio(
        &self,
        task: &AssignedTask,
        ctx: &mut TaskContext,
    ) -> Result<AudioBuffer, WorkerError> {
        ctx.set_phase(TaskPhase::FetchingAudio);
        if task.document.media_files.is_empty() {
            return Err(MediaError::Missing {
                document_id: task.document.id.clone(),
            }
            .into());
        }
        let path = media::fetch_media(
            &self.http,
            &self.media_base,
            &task.document,
            ctx.scratch_path(),
        )
        .await?;
        Ok(media::load_audio(&path)?)
    }

    /// Fetches the replica and runs the idempotent initialization
    /// transaction, pushing its change (if any) on a fresh connection.
    async fn fetch_replica(&self, document_id: &str) -> Result<DocumentReplica, WorkerError> {
        let mut replica = self.sync.fetch_document(document_id).await?;
        if let Some(change) = replica.ensure_initialized()? {
            self.sync.send_change(document_id, &change).await?;
        }
        Ok(replica)
    }

    /// Verifies the timing invariant on the post-transaction state, then
    /// forwards the change. `None` changes (no-op transactions) are skipped.
    async fn push_change(
        &self,
        document_id: &str,
        replica: &DocumentReplica,
        change: Option<Vec<u8>>,
    ) -> Result<(), WorkerError> {
        let Some(change) = change else {
            debug!(document_id, "transaction produced no change");
            return Ok(());
        };
        ensure_timing_invariant(&replica.snapshot()?)?;
        self.sync.send_change(document_id, &change).await?;
        Ok(())
    }

    /// Records progress locally and renews the task lease.
    async fn set_progress(
        &self,
        task_id: &str,
        step: &str,
        progress: Option<f64>,
        ctx: &mut TaskContext,
    ) -> Result<(), WorkerError> {
        ctx.record_progress(step, progress, None);
        self.coordinator.keepalive(task_id, progress).await?;
        Ok(())
    }

    /// TRANSCRIBE: reset the document, then append one paragraph per engine
    /// fragment, each in its own transaction with its change sent
    /// immediately so the document fills in while the job runs.
    async fn transcribe(
        &self,
        task: &AssignedTask,
        params: &TranscribeParams,
        ctx: &mut TaskContext,
    ) -> Result<serde_json::Value, WorkerError> {
        let engine = self
            .engines
            .transcription
            .clone()
            .ok_or(WorkerError::NoEngine(TaskType::Transcribe))?;

        let audio = self.fetch_audio(task, ctx).await?;
        let mut replica = self.fetch_replica(&task.document.id).await?;

        ctx.set_phase(TaskPhase::Running);
        let reset = replica.with_transaction("Reset Document", |d| d.clear_paragraphs())?;
        self.push_change(&task.document.id, &replica, reset).await?;

        let mut events = engine
            .transcribe(&audio, params, ctx.scratch_path())
            .await?;
        ctx.set_phase(TaskPhase::StreamingResults);
        while let Some(event) = events.recv().await {
            match event? {
                TranscriptionEvent::Progress(progress) => {
                    self.set_progress(&task.id, "transcription", Some(progress), ctx)
                        .await?;
                }
                TranscriptionEvent::Paragraph(paragraph) => {
                    let change = replica.with_transaction("Automatic Transcription", |d| {
                        d.push_paragraph(&paragraph)
                    })?;
                    self.push_change(&task.document.id, &replica, change).await?;
                }
            }
        }

        ctx.set_phase(TaskPhase::Completing);
        Ok(serde_json::Value::Null)
    }

    /// ALIGN: overwrite `start`/`end` of existing atoms positionally, one
    /// transaction and one change per aligned paragraph. The paragraph and
    /// atom structure is never resized.
    async fn align(
        &self,
        task: &AssignedTask,
        ctx: &mut TaskContext,
    ) -> Result<serde_json::Value, WorkerError> {
        let engine = self
            .engines
            .alignment
            .clone()
            .ok_or(WorkerError::NoEngine(TaskType::Align))?;

        let audio = self.fetch_audio(task, ctx).await?;
        let mut replica = self.fetch_replica(&task.document.id).await?;
        let document = replica.snapshot()?;

        ctx.set_phase(TaskPhase::Running);
        let mut events = engine
            .align(&document, &audio, PARAGRAPH_EXTEND_SECS, ctx.scratch_path())
            .await?;
        ctx.set_phase(TaskPhase::StreamingResults);
        while let Some(event) = events.recv().await {
            match event? {
                AlignmentEvent::Progress(progress) => {
                    self.set_progress(&task.id, "alignment", Some(progress), ctx)
                        .await?;
                }
                AlignmentEvent::Paragraph(aligned) => {
                    let change = replica.with_transaction("Alignment", |d| {
                        let atoms = d.atom_count(aligned.index)?;
                        for (atom_idx, timing) in
                            aligned.timings.iter().take(atoms).enumerate()
                        {
                            d.set_atom_timing(aligned.index, atom_idx, timing.start, timing.end)?;
                        }
                        Ok(())
                    })?;
                    self.push_change(&task.document.id, &replica, change).await?;
                }
            }
        }

        ctx.set_phase(TaskPhase::Completing);
        Ok(serde_json::Value::Null)
    }

    /// IDENTIFY_SPEAKERS: one transaction, one change at the end; discrete
    /// 0 and 1 progress milestones regardless of engine granularity.
    async fn identify_speakers(
        &self,
        task: &AssignedTask,
        params: &SpeakerIdentificationParams,
        ctx: &mut TaskContext,
    ) -> Result<serde_json::Value, WorkerError> {
        let engine = self
            .engines
            .diarization
            .clone()
            .ok_or(WorkerError::NoEngine(TaskType::IdentifySpeakers))?;

        let audio = self.fetch_audio(task, ctx).await?;
        let mut replica = self.fetch_replica(&task.document.id).await?;
        let document = replica.snapshot()?;

        self.set_progress(&task.id, "identify speakers", Some(0.0), ctx)
            .await?;

        ctx.set_phase(TaskPhase::Running);
        let mut events = engine
            .identify(&document, &audio, params, ctx.scratch_path())
            .await?;
        let mut outcome: Option<SpeakerOutcome> = None;
        while let Some(event) = events.recv().await {
            match event? {
                DiarizationEvent::Progress(progress) => {
                    self.set_progress(&task.id, "identify speakers", Some(progress), ctx)
                        .await?;
                }
                DiarizationEvent::Speakers(speakers) => outcome = Some(speakers),
            }
        }
        let outcome = outcome.ok_or_else(|| {
            EngineError::Protocol("diarization engine produced no speaker outcome".into())
        })?;

        ctx.set_phase(TaskPhase::StreamingResults);
        let change = replica.with_transaction("Speaker Identification", |d| {
            for (speaker, name) in &outcome.speaker_names {
                d.set_speaker_name(speaker, name)?;
            }
            let paragraphs = d.paragraph_count()?;
            for (idx, speaker) in outcome
                .paragraph_speakers
                .iter()
                .take(paragraphs)
                .enumerate()
            {
                if let Some(speaker) = speaker {
                    d.set_paragraph_speaker(idx, Some(speaker))?;
                }
            }
            Ok(())
        })?;
        self.push_change(&task.document.id, &replica, change).await?;

        self.set_progress(&task.id, "identify speakers", Some(1.0), ctx)
            .await?;
        ctx.set_phase(TaskPhase::Completing);
        Ok(serde_json::Value::Null)
    }
}
