pub mod client;

use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub use client::{Coordinator, CoordinatorClient};

/// Kinds of work the coordinator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Transcribe,
    Align,
    IdentifySpeakers,
}

impl TaskType {
    /// Wire form used in claim query parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Transcribe => "TRANSCRIBE",
            TaskType::Align => "ALIGN",
            TaskType::IdentifySpeakers => "IDENTIFY_SPEAKERS",
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task the coordinator has assigned to this worker.
///
/// Receiving one means the coordinator holds a lease in our name; the worker
/// is responsible for renewing it via keepalives until completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedTask {
    pub id: String,
    pub document: ApiDocument,
    #[serde(flatten)]
    pub params: TaskParams,
}

impl AssignedTask {
    pub fn task_type(&self) -> TaskType {
        match self.params {
            TaskParams::Transcribe(_) => TaskType::Transcribe,
            TaskParams::Align(_) => TaskType::Align,
            TaskParams::IdentifySpeakers(_) => TaskType::IdentifySpeakers,
        }
    }
}

/// Type-specific task payload. Dispatch is an exhaustive match over this
/// union, so an unhandled task type cannot slip through at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "task_parameters")]
pub enum TaskParams {
    #[serde(rename = "TRANSCRIBE")]
    Transcribe(TranscribeParams),
    #[serde(rename = "ALIGN")]
    Align(AlignParams),
    #[serde(rename = "IDENTIFY_SPEAKERS")]
    IdentifySpeakers(SpeakerIdentificationParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeParams {
    pub model: String,
    pub lang: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignParams {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeakerIdentificationParams {
    #[serde(default)]
    pub number_of_speakers: Option<u32>,
}

/// Document metadata as the coordinator reports it with a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDocument {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub media_files: Vec<MediaFile>,
}

/// One media attachment; `url` may be relative to the coordinator base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFile {
    pub url: String,
    pub content_type: String,
}
