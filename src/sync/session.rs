//! Websocket client for the document sync endpoint.
//!
//! Connections are short-lived and single-purpose: one to fetch a replica,
//! one per pushed change. Both directions replay the server backlog first,
//! so a pushing client is always caught up before its change is transmitted
//! and can never overwrite history it has not seen.

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::document::{CrdtDocument, DocumentReplica};
use crate::error::SyncError;
use crate::sync::{encode_change, SyncMessage};

/// Transport seam for the dispatcher; implemented by [`SyncClient`] and by
/// in-memory fakes in tests.
#[async_trait]
pub trait DocumentSync: Send + Sync {
    /// Opens a connection, replays the change backlog into a fresh replica
    /// and closes once the server signals backlog completion.
    async fn fetch_document(&self, document_id: &str) -> Result<DocumentReplica, SyncError>;

    /// Opens a connection, waits until caught up, then pushes one change.
    async fn send_change(&self, document_id: &str, change: &[u8]) -> Result<(), SyncError>;
}

pub struct SyncClient {
    base: Url,
    token: String,
}

impl SyncClient {
    /// `base` is the sync endpoint root, e.g. `ws://host/api/v1/documents/sync/`.
    pub fn new(mut base: Url, token: impl Into<String>) -> Self {
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Self {
            base,
            token: token.into(),
        }
    }

    fn document_url(&self, document_id: &str) -> Result<Url, SyncError> {
        let mut url = self
            .base
            .join(&format!("{document_id}/"))
            .map_err(|e| SyncError::BadUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("authorization", &format!("Worker {}", self.token));
        Ok(url)
    }
}

#[async_trait]
impl DocumentSync for SyncClient {
    async fn fetch_document(&self, document_id: &str) -> Result<DocumentReplica, SyncError> {
        let url = self.document_url(document_id)?;
        debug!(document_id, "fetching document replica");
        let (mut ws, _) = connect_async(url.as_str()).await?;

        let mut replica = DocumentReplica::new();
        let result = apply_backlog(&mut replica, &mut ws).await;
        let _ = ws.close(None).await;
        result?;
        Ok(replica)
    }

    async fn send_change(&self, document_id: &str, change: &[u8]) -> Result<(), SyncError> {
        let url = self.document_url(document_id)?;
        debug!(document_id, len = change.len(), "sending change");
        let (mut ws, _) = connect_async(url.as_str()).await?;

        let result = async {
            drain_backlog(&mut ws).await?;
            ws.send(Message::binary(encode_change(change))).await?;
            Ok(())
        }
        .await;
        let _ = ws.close(None).await;
        result
    }
}

/// Applies backlog frames to `replica` strictly in arrival order until the
/// server signals completion. A `FULL_DOCUMENT` frame replaces any partially
/// built state outright.
pub async fn apply_backlog<R, S>(replica: &mut R, ws: &mut S) -> Result<(), SyncError>
where
    R: CrdtDocument,
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = match ws.next().await {
            Some(msg) => msg?,
            None => return Err(SyncError::ConnectionClosed),
        };
        match msg {
            Message::Binary(data) => match SyncMessage::decode(&data)? {
                SyncMessage::Change(payload) => replica.apply_change(payload)?,
                SyncMessage::FullDocument(payload) => replica.load_snapshot(payload)?,
                SyncMessage::BacklogComplete => return Ok(()),
            },
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(_) => return Err(SyncError::ConnectionClosed),
            Message::Text(_) => {
                return Err(SyncError::Protocol("unexpected text frame".into()))
            }
        }
    }
}

/// Reads frames until backlog completion without retaining them. Used on the
/// push path, where the client only needs proof it is caught up.
async fn drain_backlog<S>(ws: &mut S) -> Result<(), SyncError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = match ws.next().await {
            Some(msg) => msg?,
            None => return Err(SyncError::ConnectionClosed),
        };
        match msg {
            Message::Binary(data) => match SyncMessage::decode(&data)? {
                SyncMessage::BacklogComplete => return Ok(()),
                SyncMessage::Change(_) | SyncMessage::FullDocument(_) => {}
            },
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(_) => return Err(SyncError::ConnectionClosed),
            Message::Text(_) => {
                return Err(SyncError::Protocol("unexpected text frame".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Atom, Paragraph};
    use crate::sync::{TAG_CHANGE, TAG_CHANGE_BACKLOG_COMPLETE, TAG_FULL_DOCUMENT};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    fn frame(tag: u8, payload: &[u8]) -> Message {
        let mut buf = vec![tag];
        buf.extend_from_slice(payload);
        Message::binary(buf)
    }

    fn sample_paragraph(text: &str, start: f64) -> Paragraph {
        Paragraph {
            speaker: None,
            children: vec![Atom {
                text: text.to_string(),
                start,
                end: start + 1.0,
            }],
        }
    }

    /// Builds a source replica plus the backlog of changes that produced it.
    fn source_with_backlog() -> (DocumentReplica, Vec<Vec<u8>>) {
        let mut source = DocumentReplica::new();
        let mut backlog = Vec::new();
        backlog.push(source.ensure_initialized().unwrap().unwrap());
        for (i, text) in ["first", "second"].iter().enumerate() {
            backlog.push(
                source
                    .with_transaction("Automatic Transcription", |editor| {
                        editor.push_paragraph(&sample_paragraph(text, i as f64))
                    })
                    .unwrap()
                    .unwrap(),
            );
        }
        (source, backlog)
    }

    async fn client_for(listener: &TcpListener) -> SyncClient {
        let addr = listener.local_addr().unwrap();
        let base = Url::parse(&format!("ws://{addr}/sync/")).unwrap();
        SyncClient::new(base, "test-token")
    }

    #[tokio::test]
    async fn fetch_applies_backlog_in_order() {
        let (source, backlog) = source_with_backlog();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for change in &backlog {
                ws.send(frame(TAG_CHANGE, change)).await.unwrap();
            }
            ws.send(frame(TAG_CHANGE_BACKLOG_COMPLETE, &[]))
                .await
                .unwrap();
            // keep the connection open until the client closes it
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });

        let replica = client.fetch_document("doc-1").await.unwrap();
        assert_eq!(replica.snapshot().unwrap(), source.snapshot().unwrap());
    }

    #[tokio::test]
    async fn full_document_frame_replaces_partial_state() {
        let (source, backlog) = source_with_backlog();
        let snapshot_bytes = source.save();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // one incremental change, then the server decides a snapshot is cheaper
            ws.send(frame(TAG_CHANGE, &backlog[0])).await.unwrap();
            ws.send(frame(TAG_FULL_DOCUMENT, &snapshot_bytes))
                .await
                .unwrap();
            ws.send(frame(TAG_CHANGE_BACKLOG_COMPLETE, &[]))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });

        let replica = client.fetch_document("doc-1").await.unwrap();
        assert_eq!(replica.snapshot().unwrap(), source.snapshot().unwrap());
    }

    #[tokio::test]
    async fn send_change_waits_for_backlog_then_pushes() {
        let (_, backlog) = source_with_backlog();
        let change = backlog[0].clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;
        let (received_tx, mut received_rx) = mpsc::channel::<Vec<u8>>(1);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(frame(TAG_CHANGE_BACKLOG_COMPLETE, &[]))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    received_tx.send(data.to_vec()).await.unwrap();
                    break;
                }
            }
        });

        client.send_change("doc-1", &change).await.unwrap();
        let received = received_rx.recv().await.unwrap();
        assert_eq!(received[0], TAG_CHANGE);
        assert_eq!(&received[1..], change.as_slice());
    }

    #[tokio::test]
    async fn malformed_tag_aborts_the_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(frame(0x42, &[1, 2, 3])).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });

        let err = client.fetch_document("doc-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn closed_connection_before_backlog_complete_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener).await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let err = client.fetch_document("doc-1").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::ConnectionClosed | SyncError::Transport(_)
        ));
    }
}
