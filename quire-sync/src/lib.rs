//! # quire-sync — Real-time document synchronization engine
//!
//! Clients edit a shared rich-text document concurrently; the server orders
//! their operations, rebases stale ones with operational transformation and
//! fans the committed result out to every other client of that document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (Session    │
//! └──────┬──────┘                     │  per conn)  │
//!        │                            └──────┬──────┘
//!        ▼                                   │
//! ┌──────────────┐             ┌─────────────┴─────────────┐
//! │ClientDocument│             ▼                           ▼
//! │ (local OT)   │     ┌───────────────┐          ┌──────────────┐
//! └──────────────┘     │ DocumentStore │─ hook ──►│ RoomRegistry │
//!                      │ (actor / doc) │          │ (fan-out)    │
//!                      └───────┬───────┘          └──────────────┘
//!                              │
//!                      ┌───────┴───────┐
//!                      │  RocksStore   │
//!                      │ records + log │
//!                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`delta`] — Operation codec: compose, transform, invert
//! - [`document`] — Document, snapshots, commit history
//! - [`storage`] — RocksDB records and checksummed operation log
//! - [`store`] — Per-document actors serialising every operation
//! - [`registry`] — Rooms of sessions per document
//! - [`session`] — Per-connection protocol state machine
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client and client-side OT
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)

pub mod client;
pub mod delta;
pub mod document;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use client::{ClientDocument, ConnectionState, PendingState, SyncClient, SyncEvent};
pub use delta::{attrs, AttrValue, AttributeMap, CodecError, Delta, Op};
pub use document::{Commit, Document, DocumentId, History, Snapshot};
pub use error::{Result, SyncError};
pub use protocol::{ClientMessage, ProtocolError, RejectReason, ServerMessage};
pub use registry::{RegistryError, RegistryStats, RoomRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionState, SyncMetrics};
pub use storage::{RocksStore, StoreConfig, StoreError};
pub use store::{DocumentStore, StoreOptions};
