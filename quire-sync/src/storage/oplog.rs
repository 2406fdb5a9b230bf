//! Append-only operation log entries.
//!
//! Every committed operation is written as one checksummed entry before
//! the submitter is acknowledged. On recovery, entries whose checksum
//! does not match are skipped and replay stops at the first gap.
//!
//! ```text
//! ┌─────────────┬──────────┬──────────────┬──────────┐
//! │ document_id │ version  │ delta        │ checksum │
//! │ string      │ u64      │ bincode ops  │ FNV-1a   │
//! └─────────────┴──────────┴──────────────┴──────────┘
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Write-Ahead Logs)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delta::Delta;
use crate::document::{Commit, DocumentId};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Op-log errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpLogError {
    #[error("op-log serialization error: {0}")]
    Serialization(String),
    #[error("op-log deserialization error: {0}")]
    Deserialization(String),
    #[error("op-log checksum mismatch at version {version}")]
    ChecksumMismatch { version: u64 },
}

/// One committed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpLogEntry {
    pub document_id: DocumentId,
    pub version: u64,
    pub delta: Delta,
    pub checksum: u32,
}

impl OpLogEntry {
    /// Create an entry with computed checksum.
    pub fn new(document_id: DocumentId, commit: &Commit) -> Result<Self, OpLogError> {
        let checksum = compute_checksum(&document_id, commit.version, &commit.delta)?;
        Ok(Self {
            document_id,
            version: commit.version,
            delta: commit.delta.clone(),
            checksum,
        })
    }

    pub fn verify(&self) -> bool {
        compute_checksum(&self.document_id, self.version, &self.delta)
            .map(|expected| expected == self.checksum)
            .unwrap_or(false)
    }

    pub fn commit(&self) -> Commit {
        Commit {
            version: self.version,
            delta: self.delta.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, OpLogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| OpLogError::Serialization(e.to_string()))
    }

    /// Decode and verify.
    pub fn decode(bytes: &[u8]) -> Result<Self, OpLogError> {
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| OpLogError::Deserialization(e.to_string()))?;
        if !entry.verify() {
            return Err(OpLogError::ChecksumMismatch {
                version: entry.version,
            });
        }
        Ok(entry)
    }
}

/// FNV-1a over the id, version, and encoded delta.
fn compute_checksum(document_id: &DocumentId, version: u64, delta: &Delta) -> Result<u32, OpLogError> {
    let payload = bincode::serde::encode_to_vec(delta, bincode::config::standard())
        .map_err(|e| OpLogError::Serialization(e.to_string()))?;

    let mut hash = FNV_OFFSET;
    let mut mix = |byte: u8| {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    };
    document_id.as_bytes().iter().copied().for_each(&mut mix);
    version.to_be_bytes().into_iter().for_each(&mut mix);
    payload.into_iter().for_each(&mut mix);
    Ok(hash)
}

/// Decode raw `(version, bytes)` rows, keeping only the run of valid
/// entries that continues contiguously from `after`.
///
/// Returns the entries and how many rows were skipped.
pub fn recover_entries(
    document_id: &DocumentId,
    after: u64,
    rows: Vec<(u64, Vec<u8>)>,
) -> (Vec<OpLogEntry>, usize) {
    let total = rows.len();
    let mut entries = Vec::with_capacity(total);
    let mut expected = after + 1;

    for (version, bytes) in rows {
        if version < expected {
            continue;
        }
        if version > expected {
            log::warn!(
                "Op log for '{document_id}' has a gap at version {expected}, stopping replay"
            );
            break;
        }
        match OpLogEntry::decode(&bytes) {
            Ok(entry) if entry.version == version && &entry.document_id == document_id => {
                entries.push(entry);
                expected += 1;
            }
            Ok(_) => {
                log::warn!("Op log entry {version} for '{document_id}' is misfiled, skipping");
            }
            Err(e) => {
                log::warn!("Skipping op log entry {version} for '{document_id}': {e}");
            }
        }
    }

    let skipped = total - entries.len();
    (entries, skipped)
}
