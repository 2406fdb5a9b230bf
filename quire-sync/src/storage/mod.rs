//! Durable storage for shared documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  commit (sync write)  ┌───────────────────────────────────┐
//! │ document     │ ────────────────────► │ CF "oplog"     — one entry/commit │
//! │ actor        │                       │   key: len ‖ id ‖ version (BE)    │
//! │ (store.rs)   │  every N commits      │                                   │
//! │              │ ────────────────────► │ CF "documents" — LZ4 record       │
//! └──────┬───────┘   + compaction        └───────────────────────────────────┘
//!        │ on start
//!        ▼
//!   record + op-log tail, read from one RocksDB snapshot
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod oplog;
pub mod rocks;

use thiserror::Error;

pub use oplog::{OpLogEntry, OpLogError};
pub use rocks::{DocumentRecord, Recovered, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("document id of {0} bytes cannot be used as a storage key")]
    InvalidKey(usize),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<OpLogError> for StoreError {
    fn from(e: OpLogError) -> Self {
        match e {
            OpLogError::Serialization(msg) => StoreError::Serialization(msg),
            other => StoreError::Deserialization(other.to_string()),
        }
    }
}
