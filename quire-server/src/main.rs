//! Quire sync server — hosts the document synchronization engine over
//! WebSocket.
//!
//! Log level is taken from `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::Parser;
use log::info;
use quire_sync::server::{ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "quire-server")]
#[command(about = "Real-time document synchronization server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents are kept in memory only when omitted
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Maximum sessions per document (0 = unlimited)
    #[arg(long, default_value_t = 100)]
    max_members: usize,

    /// Commits kept per document for rebasing stale edits
    #[arg(long, default_value_t = 1000)]
    history_limit: usize,

    /// Commits between full document records
    #[arg(long, default_value_t = 100)]
    snapshot_interval: u64,

    /// fsync every op-log append before acknowledging (`--sync-writes false` to disable)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    sync_writes: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            storage_path: self.storage,
            max_members_per_room: self.max_members,
            history_limit: self.history_limit,
            snapshot_interval: self.snapshot_interval,
            sync_writes: self.sync_writes,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    match &config.storage_path {
        Some(path) => info!("Persisting documents under {}", path.display()),
        None => info!("No storage path given, documents are kept in memory"),
    }

    let server = SyncServer::new(config)?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, writing final document records");
            server.store().shutdown().await;
        }
    }
    Ok(())
}
