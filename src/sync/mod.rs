pub mod session;

use crate::error::SyncError;

pub use session::{DocumentSync, SyncClient};

/// First byte of every binary frame on a sync connection.
pub const TAG_CHANGE: u8 = 1;
pub const TAG_CHANGE_BACKLOG_COMPLETE: u8 = 2;
pub const TAG_FULL_DOCUMENT: u8 = 3;

/// One decoded frame of the document sync protocol.
///
/// The server replays historical changes (`Change`) in causal order, may
/// substitute the whole backlog with a `FullDocument` snapshot, and marks the
/// end of the replay with `BacklogComplete`. After that point the same frame
/// layout carries client-pushed changes.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncMessage<'a> {
    Change(&'a [u8]),
    BacklogComplete,
    FullDocument(&'a [u8]),
}

impl<'a> SyncMessage<'a> {
    pub fn decode(frame: &'a [u8]) -> Result<Self, SyncError> {
        let (tag, payload) = frame
            .split_first()
            .ok_or_else(|| SyncError::Protocol("empty frame".into()))?;
        match *tag {
            TAG_CHANGE => Ok(SyncMessage::Change(payload)),
            TAG_CHANGE_BACKLOG_COMPLETE => Ok(SyncMessage::BacklogComplete),
            TAG_FULL_DOCUMENT => Ok(SyncMessage::FullDocument(payload)),
            other => Err(SyncError::Protocol(format!("unknown frame tag {other}"))),
        }
    }
}

/// Frames one change for transmission.
pub fn encode_change(change: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(change.len() + 1);
    frame.push(TAG_CHANGE);
    frame.extend_from_slice(change);
    frame
}
