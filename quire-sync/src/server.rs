//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── actor("doc1") ── RocksStore
//!            ├── Session ── store ────┤        │ (op log + records)
//! Client B ──┘      │                 └── actor("doc2")
//!                   │                          │ commit hook
//!                   └── RoomRegistry ◄─────────┘
//!                          │ EditApplied (commit order)
//!               ┌──────────┼───────────┐
//!               ▼          ▼           ▼
//!            Client A   Client B    Client C
//! ```
//!
//! One task per connection runs a [`Session`] and pumps its outbound
//! queue into the socket.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 9

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;
use crate::registry::RoomRegistry;
use crate::session::{Session, SyncMetrics};
use crate::storage::{RocksStore, StoreConfig};
use crate::store::{DocumentStore, StoreOptions};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Maximum sessions per room (0 = unlimited)
    pub max_members_per_room: usize,
    /// Commits kept per document for rebasing stale edits
    pub history_limit: usize,
    /// Commits between full document records
    pub snapshot_interval: u64,
    /// fsync every durable write
    pub sync_writes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            max_members_per_room: 100,
            history_limit: 1000,
            snapshot_interval: 100,
            sync_writes: true,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory, small windows.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: None,
            max_members_per_room: 10,
            history_limit: 64,
            snapshot_interval: 4,
            sync_writes: false,
        }
    }

    fn store_options(&self) -> StoreOptions {
        StoreOptions {
            history_limit: self.history_limit,
            snapshot_interval: self.snapshot_interval,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_rooms: usize,
    pub loaded_documents: usize,
    pub applied_operations: u64,
    pub rejected_operations: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

struct Shared {
    store: DocumentStore,
    registry: Arc<RoomRegistry>,
    metrics: Arc<SyncMetrics>,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening durable storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, SyncError> {
        let store = match &config.storage_path {
            Some(path) => {
                let rocks = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    sync_writes: config.sync_writes,
                    ..StoreConfig::default()
                })?;
                DocumentStore::durable(rocks, config.store_options())
            }
            None => DocumentStore::in_memory(config.store_options()),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                registry: Arc::new(RoomRegistry::new(config.max_members_per_room)),
                metrics: Arc::new(SyncMetrics::default()),
                total_connections: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
            }),
            config,
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: DocumentStore::in_memory(StoreOptions::default()),
                registry: Arc::new(RoomRegistry::new(ServerConfig::default().max_members_per_room)),
                metrics: Arc::new(SyncMetrics::default()),
                total_connections: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
            }),
            config: ServerConfig::default(),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match listener.local_addr() {
            Ok(addr) => log::info!("Sync server listening on {addr}"),
            Err(_) => log::info!("Sync server listening"),
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        shared.total_connections.fetch_add(1, Ordering::Relaxed);
        shared.active_connections.fetch_add(1, Ordering::Relaxed);

        let (mut session, mut outbound) = Session::new(
            shared.store.clone(),
            shared.registry.clone(),
            shared.metrics.clone(),
        );
        session.open();
        log::info!("WebSocket connection established from {addr} (session {})", session.id());

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            session.handle_frame(&data).await;
                        }
                        Some(Ok(Message::Text(_))) => {
                            session.reject_malformed("text frames are not supported");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            break Err(e.into());
                        }
                        Some(Ok(_)) => {}
                    }
                }

                Some(message) = outbound.recv() => {
                    let encoded = match message.encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            log::error!("Failed to encode message for {addr}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        session.close().await;
        shared.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let metrics = &self.shared.metrics;
        ServerStats {
            total_connections: self.shared.total_connections.load(Ordering::Relaxed),
            active_connections: self.shared.active_connections.load(Ordering::Relaxed),
            active_rooms: self.shared.registry.room_count(),
            loaded_documents: self.shared.store.loaded_documents().len(),
            applied_operations: metrics.applied_operations.load(Ordering::Relaxed),
            rejected_operations: metrics.rejected_operations.load(Ordering::Relaxed),
            total_frames: metrics.frames_received.load(Ordering::Relaxed),
            total_bytes: metrics.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.shared.store
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.shared.registry
    }
}
