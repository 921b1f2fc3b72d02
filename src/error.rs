//! Error types for the worker.
//!
//! Each boundary gets its own enum so callers can tell transient transport
//! trouble apart from terminal task failures. The loop-level policy in
//! `worker::runner` depends on that distinction.

use crate::api::TaskType;

/// Top-level error for a task attempt.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("coordinator API error: {0}")]
    Api(#[from] ApiError),

    #[error("document sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("document replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("timing invariant violated: {0}")]
    Timing(#[from] TimingViolation),

    #[error("no engine configured for task type {0}")]
    NoEngine(TaskType),
}

/// Errors from the coordinator REST API.
///
/// `Transport` means the request never got a response (refused, timeout,
/// DNS). A non-2xx response is `Status`. Neither is ever folded into a
/// "no task" result.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("coordinator returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("could not decode coordinator response: {0}")]
    InvalidResponse(String),

    #[error("coordinator assigned an unusable task: {0}")]
    InvalidTask(String),
}

impl ApiError {
    /// True for failures that are expected to clear on their own.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

/// Errors on the websocket sync connection.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("websocket transport failure: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("sync protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed before backlog completed")]
    ConnectionClosed,

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error("invalid sync url: {0}")]
    BadUrl(String),
}

/// Errors from the CRDT-backed document replica.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("crdt error: {0}")]
    Crdt(#[from] automerge::AutomergeError),

    #[error("received change could not be decoded: {0}")]
    BadChange(#[from] automerge::LoadChangeError),

    #[error("document structure is corrupt: {0}")]
    Corrupt(String),
}

/// Errors while obtaining or decoding task media.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("document {document_id} has no media attached")]
    Missing { document_id: String },

    #[error("media download failed: {0}")]
    Download(String),

    #[error("unsupported media format: {0}")]
    UnsupportedFormat(String),

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("ffmpeg failed: {0}")]
    Convert(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from an external processing engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start engine process: {0}")]
    Spawn(String),

    #[error("engine emitted malformed output: {0}")]
    Protocol(String),

    #[error("engine failed: {0}")]
    Failed(String),
}

/// The global ordering invariant over atom start times was broken.
#[derive(Debug, thiserror::Error)]
#[error(
    "atom {atom} of paragraph {paragraph} starts at {start}, before preceding atom at {prev_start}"
)]
pub struct TimingViolation {
    pub paragraph: usize,
    pub atom: usize,
    pub prev_start: f64,
    pub start: f64,
}
