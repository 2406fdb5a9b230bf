//! Transport-free client half of the OT protocol.
//!
//! At most one local operation is in flight. Edits made while it is
//! unacknowledged are composed into a buffer and sent when the ack arrives.
//!
//! ```text
//!                 local edit                    local edit
//!  Synchronized ─────────────► AwaitingAck ─────────────► AwaitingAckWithBuffer
//!       ▲                         │   ▲                          │ │ local edit
//!       └──────── ack ────────────┘   └───── ack (send buffer) ──┘ └─► (compose)
//! ```
//!
//! Remote operations are transformed against whatever is pending so the
//! local content stays equal to `server state ∘ outstanding ∘ buffer`.

use crate::delta::{CodecError, Delta};
use crate::document::Snapshot;

/// Local operations not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    Synchronized,
    AwaitingAck {
        outstanding: Delta,
    },
    AwaitingAckWithBuffer {
        outstanding: Delta,
        buffer: Delta,
    },
}

/// Client copy of a document.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    content: Delta,
    version: u64,
    pending: PendingState,
}

impl ClientDocument {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            content: snapshot.content,
            version: snapshot.version,
            pending: PendingState::Synchronized,
        }
    }

    pub fn content(&self) -> &Delta {
        &self.content
    }

    pub fn text(&self) -> String {
        self.content.to_text()
    }

    /// Last server version this copy has seen.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending(&self) -> &PendingState {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        self.pending != PendingState::Synchronized
    }

    /// Apply a local edit. Returns `(base_version, delta)` when it should be
    /// sent right away; `None` when it was buffered behind an in-flight op.
    pub fn apply_local(&mut self, delta: Delta) -> Result<Option<(u64, Delta)>, CodecError> {
        let delta = delta.try_normalized()?;
        self.content = delta.apply(&self.content)?;

        let (pending, send) = match std::mem::replace(&mut self.pending, PendingState::Synchronized) {
            PendingState::Synchronized => (
                PendingState::AwaitingAck {
                    outstanding: delta.clone(),
                },
                Some((self.version, delta)),
            ),
            PendingState::AwaitingAck { outstanding } => (
                PendingState::AwaitingAckWithBuffer {
                    outstanding,
                    buffer: delta,
                },
                None,
            ),
            PendingState::AwaitingAckWithBuffer {
                outstanding,
                buffer,
            } => (
                PendingState::AwaitingAckWithBuffer {
                    outstanding,
                    buffer: buffer.compose(&delta),
                },
                None,
            ),
        };
        self.pending = pending;
        Ok(send)
    }

    /// Apply an operation another client committed at `version`. Returns
    /// the operation as applied to the local content.
    ///
    /// The server orders remote commits before anything still pending here,
    /// so the remote side wins insert ties.
    pub fn apply_remote(&mut self, delta: Delta, version: u64) -> Result<Delta, CodecError> {
        let (local, pending) = match &self.pending {
            PendingState::Synchronized => (delta, PendingState::Synchronized),
            PendingState::AwaitingAck { outstanding } => (
                outstanding.transform(&delta, false),
                PendingState::AwaitingAck {
                    outstanding: delta.transform(outstanding, true),
                },
            ),
            PendingState::AwaitingAckWithBuffer {
                outstanding,
                buffer,
            } => {
                let past_outstanding = outstanding.transform(&delta, false);
                let local = buffer.transform(&past_outstanding, false);
                (
                    local,
                    PendingState::AwaitingAckWithBuffer {
                        outstanding: delta.transform(outstanding, true),
                        buffer: past_outstanding.transform(buffer, true),
                    },
                )
            }
        };

        self.content = local.apply(&self.content)?;
        self.pending = pending;
        self.version = version;
        Ok(local)
    }

    /// The in-flight operation was committed at `version`. Returns the
    /// buffered operation to send next, if any.
    pub fn acknowledge(&mut self, version: u64) -> Option<(u64, Delta)> {
        self.version = version;
        match std::mem::replace(&mut self.pending, PendingState::Synchronized) {
            PendingState::Synchronized => {
                log::warn!("Acknowledgement for version {version} with nothing in flight");
                None
            }
            PendingState::AwaitingAck { .. } => None,
            PendingState::AwaitingAckWithBuffer { buffer, .. } => {
                self.pending = PendingState::AwaitingAck {
                    outstanding: buffer.clone(),
                };
                Some((version, buffer))
            }
        }
    }
}
