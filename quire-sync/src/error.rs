//! Error taxonomy for the synchronization engine.
//!
//! ```text
//! CodecError ──┐
//! StoreError ──┼──► SyncError ──► RejectReason (wire)
//! OpLogError ──┤
//! RegistryError┘
//! ```
//!
//! Every per-operation error is recovered at the session boundary and
//! reported to the affected session only.

use thiserror::Error;

use crate::delta::CodecError;
use crate::document::DocumentId;
use crate::protocol::{ProtocolError, RejectReason};
use crate::registry::RegistryError;
use crate::storage::{OpLogError, StoreError};

/// Engine-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The operation walks past the end of the document.
    #[error("operation out of range: {0}")]
    OutOfRangeOperation(#[from] CodecError),

    /// The operation cannot be rebased onto the current version.
    #[error("cannot rebase operation from version {base} onto version {current}")]
    VersionConflictUnresolvable { base: u64, current: u64 },

    /// Persistence failed or the document actor is gone.
    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),

    /// The transport closed underneath us.
    #[error("connection lost")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("room for document '{document}' is full ({max} members)")]
    RoomFull { document: DocumentId, max: usize },

    /// Edits are not accepted before the snapshot has been received.
    #[error("document is not synchronized yet")]
    NotSynchronized,
}

impl SyncError {
    /// Wire-level reason reported to the session that caused the error.
    pub fn reason(&self) -> RejectReason {
        match self {
            SyncError::OutOfRangeOperation(CodecError::Overflow) => RejectReason::Malformed,
            SyncError::OutOfRangeOperation(_) => RejectReason::OutOfRange,
            SyncError::VersionConflictUnresolvable { .. } => RejectReason::VersionConflict,
            SyncError::StoreUnavailable(_) | SyncError::ConnectionLost => {
                RejectReason::StoreUnavailable
            }
            SyncError::Protocol(_) => RejectReason::Malformed,
            SyncError::RoomFull { .. } => RejectReason::RoomFull,
            SyncError::NotSynchronized => RejectReason::NotSynchronized,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::StoreUnavailable(e.to_string())
    }
}

impl From<OpLogError> for SyncError {
    fn from(e: OpLogError) -> Self {
        SyncError::StoreUnavailable(e.to_string())
    }
}

impl From<RegistryError> for SyncError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::RoomFull { document, max } => SyncError::RoomFull { document, max },
        }
    }
}

/// Engine result alias.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
