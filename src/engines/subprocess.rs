//! Engine adapter that runs an external command per task.
//!
//! The worker writes the normalized audio to a scratch WAV, sends one JSON
//! request object on the command's stdin, and reads newline-delimited JSON
//! events from its stdout:
//!
//! ```text
//! {"kind": "progress", "value": 0.42}
//! {"kind": "paragraph", "paragraph": {"speaker": null, "children": [...]}}
//! {"kind": "aligned", "index": 0, "timings": [{"start": 0.0, "end": 0.8}]}
//! {"kind": "speakers", "speaker_names": {...}, "paragraph_speakers": [...]}
//! {"kind": "error", "message": "..."}
//! ```
//!
//! Which event kinds are accepted depends on the action that started the run;
//! anything else is a protocol violation.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{SpeakerIdentificationParams, TranscribeParams};
use crate::document::{Document, Paragraph};
use crate::engines::{
    AlignedParagraph, AlignmentEngine, AlignmentEvent, AtomTiming, DiarizationEngine,
    DiarizationEvent, EngineStream, SpeakerOutcome, TranscriptionEngine, TranscriptionEvent,
};
use crate::error::EngineError;
use crate::media::{self, AudioBuffer};

/// One stdout line from the engine process.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EngineLine {
    Progress {
        value: f64,
    },
    Paragraph {
        paragraph: Paragraph,
    },
    Aligned {
        index: usize,
        timings: Vec<AtomTiming>,
    },
    Speakers {
        #[serde(default)]
        speaker_names: BTreeMap<String, String>,
        #[serde(default)]
        paragraph_speakers: Vec<Option<String>>,
    },
    Error {
        message: String,
    },
}

/// Runs one external command per engine invocation.
#[derive(Debug, Clone)]
pub struct SubprocessEngine {
    command: Vec<String>,
}

impl SubprocessEngine {
    pub fn new(command: Vec<String>) -> Result<Self, EngineError> {
        if command.is_empty() {
            return Err(EngineError::Spawn("empty engine command".into()));
        }
        Ok(Self { command })
    }

    fn write_audio(&self, audio: &AudioBuffer, work_dir: &Path) -> Result<String, EngineError> {
        let path = work_dir.join("engine_input.wav");
        media::write_wav(&path, audio).map_err(|e| EngineError::Spawn(e.to_string()))?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn run<T: Send + 'static>(
        &self,
        request: serde_json::Value,
        map: fn(EngineLine) -> Result<T, EngineError>,
    ) -> Result<EngineStream<T>, EngineError> {
        debug!(command = ?self.command, "starting engine process");
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {e}", self.command[0])))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Spawn("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("engine stdout unavailable".into()))?;

        let mut request_line = serde_json::to_string(&request)
            .map_err(|e| EngineError::Spawn(format!("encode request: {e}")))?;
        request_line.push('\n');

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Engines are not required to read their request; ignore pipe errors.
            if let Err(e) = stdin.write_all(request_line.as_bytes()).await {
                warn!(error = %e, "engine did not accept request payload");
            }
            drop(stdin);

            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let item = serde_json::from_str::<EngineLine>(&line)
                            .map_err(|e| {
                                EngineError::Protocol(format!("bad engine line '{line}': {e}"))
                            })
                            .and_then(map);
                        let stop = item.is_err();
                        if tx.send(item).await.is_err() || stop {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::Protocol(format!("engine stdout: {e}"))))
                            .await;
                        break;
                    }
                }
            }
            // closing stdout lets a still-chatty engine hit EPIPE and exit
            drop(lines);

            match child.wait().await {
                Ok(status) if !status.success() => {
                    let _ = tx
                        .send(Err(EngineError::Failed(format!(
                            "engine exited with {status}"
                        ))))
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(Err(EngineError::Failed(e.to_string()))).await;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl TranscriptionEngine for SubprocessEngine {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        params: &TranscribeParams,
        work_dir: &Path,
    ) -> Result<EngineStream<TranscriptionEvent>, EngineError> {
        let audio_path = self.write_audio(audio, work_dir)?;
        let request = serde_json::json!({
            "action": "transcribe",
            "audio": audio_path,
            "model": params.model,
            "lang": params.lang,
        });
        self.run(request, |line| match line {
            EngineLine::Progress { value } => Ok(TranscriptionEvent::Progress(value)),
            EngineLine::Paragraph { paragraph } => Ok(TranscriptionEvent::Paragraph(paragraph)),
            EngineLine::Error { message } => Err(EngineError::Failed(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected event during transcription: {other:?}"
            ))),
        })
        .await
    }
}

#[async_trait]
impl AlignmentEngine for SubprocessEngine {
    async fn align(
        &self,
        document: &Document,
        audio: &AudioBuffer,
        extend_duration: f64,
        work_dir: &Path,
    ) -> Result<EngineStream<AlignmentEvent>, EngineError> {
        let audio_path = self.write_audio(audio, work_dir)?;
        let request = serde_json::json!({
            "action": "align",
            "audio": audio_path,
            "document": document,
            "extend_duration": extend_duration,
        });
        self.run(request, |line| match line {
            EngineLine::Progress { value } => Ok(AlignmentEvent::Progress(value)),
            EngineLine::Aligned { index, timings } => {
                Ok(AlignmentEvent::Paragraph(AlignedParagraph {
                    index,
                    timings,
                }))
            }
            EngineLine::Error { message } => Err(EngineError::Failed(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected event during alignment: {other:?}"
            ))),
        })
        .await
    }
}

#[async_trait]
impl DiarizationEngine for SubprocessEngine {
    async fn identify(
        &self,
        document: &Document,
        audio: &AudioBuffer,
        params: &SpeakerIdentificationParams,
        work_dir: &Path,
    ) -> Result<EngineStream<DiarizationEvent>, EngineError> {
        let audio_path = self.write_audio(audio, work_dir)?;
        let request = serde_json::json!({
            "action": "identify_speakers",
            "audio": audio_path,
            "document": document,
            "number_of_speakers": params.number_of_speakers,
        });
        self.run(request, |line| match line {
            EngineLine::Progress { value } => Ok(DiarizationEvent::Progress(value)),
            EngineLine::Speakers {
                speaker_names,
                paragraph_speakers,
            } => Ok(DiarizationEvent::Speakers(SpeakerOutcome {
                speaker_names,
                paragraph_speakers,
            })),
            EngineLine::Error { message } => Err(EngineError::Failed(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected event during diarization: {other:?}"
            ))),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_audio() -> AudioBuffer {
        AudioBuffer {
            samples: vec![0.0; 1600],
            sample_rate: crate::media::TARGET_SAMPLE_RATE,
        }
    }

    fn shell_engine(script: &str) -> SubprocessEngine {
        SubprocessEngine::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
        .unwrap()
    }

    async fn collect<T>(mut stream: EngineStream<T>) -> Vec<Result<T, EngineError>> {
        let mut items = Vec::new();
        while let Some(item) = stream.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn transcription_events_stream_in_order() {
        let dir = tempdir().unwrap();
        let engine = shell_engine(
            r#"cat > /dev/null
echo '{"kind":"progress","value":0.5}'
echo '{"kind":"paragraph","paragraph":{"speaker":null,"children":[{"text":"hello","start":0.0,"end":0.8}]}}'
echo '{"kind":"progress","value":1.0}'"#,
        );

        let params = TranscribeParams {
            model: "base".into(),
            lang: "en".into(),
        };
        let stream = engine
            .transcribe(&test_audio(), &params, dir.path())
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            Ok(TranscriptionEvent::Progress(p)) if p == 0.5
        ));
        match &events[1] {
            Ok(TranscriptionEvent::Paragraph(p)) => {
                assert_eq!(p.children[0].text, "hello");
                assert_eq!(p.children[0].end, 0.8);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_payload_reaches_the_engine() {
        let dir = tempdir().unwrap();
        // echo the request's action back as an error message
        let engine = shell_engine(
            r#"read line
action=$(printf '%s' "$line" | sed 's/.*"action":"\([a-z_]*\)".*/\1/')
echo "{\"kind\":\"error\",\"message\":\"$action\"}""#,
        );

        let params = TranscribeParams {
            model: "base".into(),
            lang: "en".into(),
        };
        let stream = engine
            .transcribe(&test_audio(), &params, dir.path())
            .await
            .unwrap();
        let events = collect(stream).await;
        assert!(matches!(
            &events[0],
            Err(EngineError::Failed(msg)) if msg == "transcribe"
        ));
    }

    #[tokio::test]
    async fn malformed_line_is_a_protocol_error() {
        let dir = tempdir().unwrap();
        let engine = shell_engine("cat > /dev/null; echo 'this is not json'");

        let params = TranscribeParams {
            model: "base".into(),
            lang: "en".into(),
        };
        let stream = engine
            .transcribe(&test_audio(), &params, dir.path())
            .await
            .unwrap();
        let events = collect(stream).await;
        assert!(matches!(&events[0], Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn wrong_event_kind_for_action_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = shell_engine(
            r#"cat > /dev/null
echo '{"kind":"paragraph","paragraph":{"speaker":null,"children":[]}}'"#,
        );

        let stream = engine
            .align(&Document::default(), &test_audio(), 0.5, dir.path())
            .await
            .unwrap();
        let events = collect(stream).await;
        assert!(matches!(&events[0], Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_as_failure() {
        let dir = tempdir().unwrap();
        let engine = shell_engine("cat > /dev/null; exit 3");

        let stream = engine
            .identify(
                &Document::default(),
                &test_audio(),
                &SpeakerIdentificationParams::default(),
                dir.path(),
            )
            .await
            .unwrap();
        let events = collect(stream).await;
        assert!(matches!(events.last(), Some(Err(EngineError::Failed(_)))));
    }

    #[tokio::test]
    async fn diarization_outcome_parses() {
        let dir = tempdir().unwrap();
        let engine = shell_engine(
            r#"cat > /dev/null
echo '{"kind":"speakers","speaker_names":{"spk_0":"Speaker 0"},"paragraph_speakers":["spk_0",null]}'"#,
        );

        let stream = engine
            .identify(
                &Document::default(),
                &test_audio(),
                &SpeakerIdentificationParams::default(),
                dir.path(),
            )
            .await
            .unwrap();
        let events = collect(stream).await;
        match &events[0] {
            Ok(DiarizationEvent::Speakers(outcome)) => {
                assert_eq!(outcome.speaker_names.get("spk_0").unwrap(), "Speaker 0");
                assert_eq!(
                    outcome.paragraph_speakers,
                    vec![Some("spk_0".to_string()), None]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
