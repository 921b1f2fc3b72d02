//! External algorithm boundary.
//!
//! Transcription, alignment and diarization are black boxes to the worker:
//! each consumes decoded audio plus parameters and produces a stream of
//! result fragments and progress estimates. The traits here are the only
//! contract; [`subprocess::SubprocessEngine`] is the shipped implementation,
//! driving an external command over a JSON-lines protocol.

pub mod subprocess;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::{SpeakerIdentificationParams, TaskType, TranscribeParams};
use crate::document::{Document, Paragraph};
use crate::error::EngineError;
use crate::media::AudioBuffer;

pub use subprocess::SubprocessEngine;

/// Fragment/progress stream produced by an engine run. The stream ends when
/// the engine is done; a terminal `Err` item means the run failed.
pub type EngineStream<T> = mpsc::Receiver<Result<T, EngineError>>;

#[derive(Debug, Clone)]
pub enum TranscriptionEvent {
    /// Engine-estimated completion in [0, 1].
    Progress(f64),
    Paragraph(Paragraph),
}

#[derive(Debug, Clone)]
pub enum AlignmentEvent {
    Progress(f64),
    Paragraph(AlignedParagraph),
}

#[derive(Debug, Clone)]
pub enum DiarizationEvent {
    Progress(f64),
    Speakers(SpeakerOutcome),
}

/// New timings for the atoms of one existing paragraph, matched positionally:
/// the Nth timing updates the Nth atom. Never resizes the paragraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignedParagraph {
    pub index: usize,
    pub timings: Vec<AtomTiming>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AtomTiming {
    pub start: f64,
    pub end: f64,
}

/// Result of a diarization run: display names per speaker id, plus one
/// speaker reference per paragraph in document order (`None` leaves the
/// paragraph untouched).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeakerOutcome {
    #[serde(default)]
    pub speaker_names: BTreeMap<String, String>,
    #[serde(default)]
    pub paragraph_speakers: Vec<Option<String>>,
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        params: &TranscribeParams,
        work_dir: &Path,
    ) -> Result<EngineStream<TranscriptionEvent>, EngineError>;
}

#[async_trait]
pub trait AlignmentEngine: Send + Sync {
    /// `extend_duration` widens the audio window considered around each
    /// paragraph, in seconds.
    async fn align(
        &self,
        document: &Document,
        audio: &AudioBuffer,
        extend_duration: f64,
        work_dir: &Path,
    ) -> Result<EngineStream<AlignmentEvent>, EngineError>;
}

#[async_trait]
pub trait DiarizationEngine: Send + Sync {
    async fn identify(
        &self,
        document: &Document,
        audio: &AudioBuffer,
        params: &SpeakerIdentificationParams,
        work_dir: &Path,
    ) -> Result<EngineStream<DiarizationEvent>, EngineError>;
}

/// The engines this worker process has available. The claim loop only asks
/// the coordinator for task types it can actually run.
#[derive(Clone, Default)]
pub struct EngineSet {
    pub transcription: Option<Arc<dyn TranscriptionEngine>>,
    pub alignment: Option<Arc<dyn AlignmentEngine>>,
    pub diarization: Option<Arc<dyn DiarizationEngine>>,
}

impl EngineSet {
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types = Vec::new();
        if self.diarization.is_some() {
            types.push(TaskType::IdentifySpeakers);
        }
        if self.alignment.is_some() {
            types.push(TaskType::Align);
        }
        if self.transcription.is_some() {
            types.push(TaskType::Transcribe);
        }
        types
    }

    pub fn is_empty(&self) -> bool {
        self.task_types().is_empty()
    }
}
