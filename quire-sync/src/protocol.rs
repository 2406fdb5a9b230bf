//! Binary protocol between sync clients and the server.
//!
//! One bincode-encoded message per binary WebSocket frame:
//! ```text
//!  client                              server
//!    │ ── Join { document_id } ─────────► │
//!    │ ◄──────── Snapshot { content, v } ─ │   exactly once per join
//!    │ ── Edit { base_version, delta } ─► │
//!    │ ◄──────────── EditAck { version } ─ │   originator only
//!    │                                    │ ── EditApplied { delta, v } ──► others
//!    │ ◄─ EditRejected { reason, msg } ── │   originator only
//!    │ ── Ping ─────────────────────────► │
//!    │ ◄─────────────────────────── Pong ─ │
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delta::Delta;
use crate::document::{DocumentId, Snapshot};

/// Largest frame accepted by the decoder.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Why a join or edit was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// The operation walks past the end of the document.
    OutOfRange,
    /// The base version cannot be rebased onto the current one.
    VersionConflict,
    /// Persistence failed; retrying may succeed.
    StoreUnavailable,
    /// Edits arrive before the snapshot was delivered.
    NotSynchronized,
    /// The connection already joined a document.
    AlreadyJoined,
    /// The frame or its contents could not be understood.
    Malformed,
    RoomFull,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join { document_id: DocumentId },
    Edit { base_version: u64, delta: Delta },
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Snapshot { content: Delta, version: u64 },
    EditApplied { delta: Delta, version: u64 },
    EditAck { version: u64 },
    EditRejected { reason: RejectReason, message: String },
    JoinFailed { reason: RejectReason, message: String },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn snapshot(snapshot: &Snapshot) -> Self {
        ServerMessage::Snapshot {
            content: snapshot.content.clone(),
            version: snapshot.version,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
    let (value, read) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes(bytes.len() - read));
    }
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("connection closed")]
    ConnectionClosed,
}
