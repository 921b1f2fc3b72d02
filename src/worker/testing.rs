//! Shared fakes and fixtures for worker tests.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use tokio::sync::mpsc;
use url::Url;

use crate::api::{
    AlignParams, ApiDocument, AssignedTask, Coordinator, MediaFile, SpeakerIdentificationParams,
    TaskParams, TaskType, TranscribeParams,
};
use crate::document::{Atom, CrdtDocument, Document, DocumentReplica, Paragraph};
use crate::engines::{
    AlignmentEngine, AlignmentEvent, DiarizationEngine, DiarizationEvent, EngineSet, EngineStream,
    TranscriptionEngine, TranscriptionEvent,
};
use crate::error::{ApiError, EngineError, SyncError};
use crate::media::{AudioBuffer, TARGET_SAMPLE_RATE};
use crate::sync::DocumentSync;

/// Coordinator fake: hands out queued tasks, records keepalives and
/// completion reports, optionally fails every claim with a transport error.
#[derive(Default)]
pub struct MockCoordinator {
    pub tasks: Mutex<VecDeque<AssignedTask>>,
    pub claims: AtomicUsize,
    pub fail_claims: AtomicBool,
    pub keepalives: Mutex<Vec<(String, Option<f64>)>>,
    pub completions: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MockCoordinator {
    pub fn with_tasks(tasks: Vec<AssignedTask>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into()),
            ..Self::default()
        }
    }

    pub fn claim_count(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    async fn claim(&self, _task_types: &[TaskType]) -> Result<Option<AssignedTask>, ApiError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("connection refused".into()));
        }
        Ok(self.tasks.lock().unwrap().pop_front())
    }

    async fn keepalive(&self, task_id: &str, progress: Option<f64>) -> Result<(), ApiError> {
        self.keepalives
            .lock()
            .unwrap()
            .push((task_id.to_string(), progress));
        Ok(())
    }

    async fn mark_completed(
        &self,
        task_id: &str,
        completion_data: serde_json::Value,
    ) -> Result<(), ApiError> {
        self.completions
            .lock()
            .unwrap()
            .push((task_id.to_string(), completion_data));
        Ok(())
    }
}

/// In-memory stand-in for the sync server: serves a seeded backlog on fetch
/// (plus everything received so far) and records every pushed change.
#[derive(Default)]
pub struct MemorySync {
    pub backlog: Mutex<Vec<Vec<u8>>>,
    pub changes: Mutex<Vec<Vec<u8>>>,
    pub fail_fetches: AtomicBool,
    fetches: AtomicUsize,
    sends: AtomicUsize,
}

impl MemorySync {
    pub fn seeded(backlog: Vec<Vec<u8>>) -> Self {
        Self {
            backlog: Mutex::new(backlog),
            ..Self::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSync for MemorySync {
    async fn fetch_document(&self, _document_id: &str) -> Result<DocumentReplica, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(SyncError::Protocol("injected fetch failure".into()));
        }
        let mut replica = DocumentReplica::new();
        let backlog = self.backlog.lock().unwrap().clone();
        let received = self.changes.lock().unwrap().clone();
        for change in backlog.iter().chain(received.iter()) {
            replica.apply_change(change)?;
        }
        Ok(replica)
    }

    async fn send_change(&self, _document_id: &str, change: &[u8]) -> Result<(), SyncError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.changes.lock().unwrap().push(change.to_vec());
        Ok(())
    }
}

/// Single-atom paragraph fixture.
pub fn paragraph(text: &str, start: f64) -> Paragraph {
    Paragraph {
        speaker: None,
        children: vec![Atom {
            text: text.to_string(),
            start,
            end: start + 0.5,
        }],
    }
}

/// Backlog of a document some other worker already initialized.
pub fn initialized_backlog() -> Vec<Vec<u8>> {
    let mut replica = DocumentReplica::new();
    vec![replica.ensure_initialized().unwrap().unwrap()]
}

fn params_for(task_type: TaskType) -> TaskParams {
    match task_type {
        TaskType::Transcribe => TaskParams::Transcribe(TranscribeParams {
            model: "base".into(),
            lang: "en".into(),
        }),
        TaskType::Align => TaskParams::Align(AlignParams {}),
        TaskType::IdentifySpeakers => {
            TaskParams::IdentifySpeakers(SpeakerIdentificationParams::default())
        }
    }
}

pub fn task_with_media(task_type: TaskType) -> AssignedTask {
    AssignedTask {
        id: "task-1".into(),
        document: ApiDocument {
            id: "doc-1".into(),
            name: Some("fixture".into()),
            media_files: vec![MediaFile {
                url: "/media/test.wav".into(),
                content_type: "audio/wav".into(),
            }],
        },
        params: params_for(task_type),
    }
}

pub fn task_without_media(task_type: TaskType) -> AssignedTask {
    AssignedTask {
        id: "task-1".into(),
        document: ApiDocument {
            id: "doc-1".into(),
            name: None,
            media_files: vec![],
        },
        params: params_for(task_type),
    }
}

fn test_wav_bytes() -> Vec<u8> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..1600 {
            writer
                .write_sample((f32::sin(i as f32 * 0.05) * 16000.0) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Spawns an HTTP server offering `/media/test.wav`; returns its base URL.
pub async fn serve_media() -> Url {
    let wav = test_wav_bytes();
    let app = axum::Router::new().route(
        "/media/test.wav",
        axum::routing::get(move || {
            let wav = wav.clone();
            async move {
                (
                    [(axum::http::header::CONTENT_TYPE, "audio/wav")],
                    wav,
                )
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

fn stream_of<T: Send + 'static>(events: Vec<Result<T, EngineError>>) -> EngineStream<T> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        for event in events {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Transcription engine that plays back a scripted event sequence once.
pub struct ScriptedTranscription {
    events: Mutex<Option<Vec<Result<TranscriptionEvent, EngineError>>>>,
}

impl ScriptedTranscription {
    pub fn new(events: Vec<Result<TranscriptionEvent, EngineError>>) -> Self {
        Self {
            events: Mutex::new(Some(events)),
        }
    }
}

#[async_trait]
impl TranscriptionEngine for ScriptedTranscription {
    async fn transcribe(
        &self,
        _audio: &AudioBuffer,
        _params: &TranscribeParams,
        _work_dir: &Path,
    ) -> Result<EngineStream<TranscriptionEvent>, EngineError> {
        Ok(stream_of(
            self.events.lock().unwrap().take().unwrap_or_default(),
        ))
    }
}

pub struct ScriptedAlignment {
    events: Mutex<Option<Vec<Result<AlignmentEvent, EngineError>>>>,
}

impl ScriptedAlignment {
    pub fn new(events: Vec<Result<AlignmentEvent, EngineError>>) -> Self {
        Self {
            events: Mutex::new(Some(events)),
        }
    }
}

#[async_trait]
impl AlignmentEngine for ScriptedAlignment {
    async fn align(
        &self,
        _document: &Document,
        _audio: &AudioBuffer,
        _extend_duration: f64,
        _work_dir: &Path,
    ) -> Result<EngineStream<AlignmentEvent>, EngineError> {
        Ok(stream_of(
            self.events.lock().unwrap().take().unwrap_or_default(),
        ))
    }
}

pub struct ScriptedDiarization {
    events: Mutex<Option<Vec<Result<DiarizationEvent, EngineError>>>>,
}

impl ScriptedDiarization {
    pub fn new(events: Vec<Result<DiarizationEvent, EngineError>>) -> Self {
        Self {
            events: Mutex::new(Some(events)),
        }
    }
}

#[async_trait]
impl DiarizationEngine for ScriptedDiarization {
    async fn identify(
        &self,
        _document: &Document,
        _audio: &AudioBuffer,
        _params: &SpeakerIdentificationParams,
        _work_dir: &Path,
    ) -> Result<EngineStream<DiarizationEvent>, EngineError> {
        Ok(stream_of(
            self.events.lock().unwrap().take().unwrap_or_default(),
        ))
    }
}

/// Builds an [`EngineSet`] from scripted engines.
pub fn engines_with(
    transcription: Option<ScriptedTranscription>,
    alignment: Option<ScriptedAlignment>,
    diarization: Option<ScriptedDiarization>,
) -> EngineSet {
    EngineSet {
        transcription: transcription
            .map(|e| Arc::new(e) as Arc<dyn TranscriptionEngine>),
        alignment: alignment.map(|e| Arc::new(e) as Arc<dyn AlignmentEngine>),
        diarization: diarization.map(|e| Arc::new(e) as Arc<dyn DiarizationEngine>),
    }
}
