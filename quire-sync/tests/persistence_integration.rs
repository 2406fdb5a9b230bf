//! Persistence integration tests.
//!
//! Verifies that:
//! 1. Committed edits survive a store restart
//! 2. The op-log tail is replayed on top of the last record
//! 3. Corrupted op-log entries are skipped and never replayed
//! 4. Rebase history is rebuilt from the retained op log
//! 5. The server writes a record when a room empties

use futures_util::{SinkExt, StreamExt};
use quire_sync::delta::Delta;
use quire_sync::document::{Commit, DocumentId, Snapshot};
use quire_sync::error::SyncError;
use quire_sync::protocol::{ClientMessage, ServerMessage};
use quire_sync::server::{ServerConfig, SyncServer};
use quire_sync::storage::{DocumentRecord, OpLogEntry, RocksStore, StoreConfig};
use quire_sync::store::{DocumentStore, StoreOptions};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

fn open_rocks(path: &Path) -> RocksStore {
    RocksStore::open(StoreConfig::for_testing(path)).unwrap()
}

fn open_store(path: &Path, options: StoreOptions) -> DocumentStore {
    DocumentStore::durable(open_rocks(path), options)
}

/// `<u16 BE id length><id><u64 BE version>`
fn raw_oplog_key(id: &str, version: u64) -> Vec<u8> {
    let mut key = (id.len() as u16).to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn append(rocks: &RocksStore, id: &DocumentId, version: u64, delta: Delta) {
    let entry = OpLogEntry::new(id.clone(), &Commit { version, delta }).unwrap();
    rocks.append(&entry).unwrap();
}

#[tokio::test]
async fn test_commits_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let id = DocumentId::from("notes");

    {
        let store = open_store(&path, StoreOptions::for_testing());
        store.apply_operation(&id, 0, Delta::new().insert("hello")).await.unwrap();
        store
            .apply_operation(&id, 1, Delta::new().retain(5).insert(" world"))
            .await
            .unwrap();
        store
            .apply_operation(&id, 2, Delta::new().delete(1).insert("H"))
            .await
            .unwrap();
        store.shutdown().await;
    }

    let store = open_store(&path, StoreOptions::for_testing());
    let snapshot = store.load_or_create(&id).await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.content.to_text(), "Hello world");
}

#[tokio::test]
async fn test_log_tail_replayed_over_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let id = DocumentId::from("tail");

    {
        let rocks = open_rocks(&path);
        let record = DocumentRecord::new(Snapshot {
            content: Delta::from_text("hello"),
            version: 1,
        });
        rocks.save_record(&id, &record, None).unwrap();
        append(&rocks, &id, 2, Delta::new().retain(5).insert(" world"));
        append(&rocks, &id, 3, Delta::new().retain(11).insert("!"));
    }

    let store = open_store(&path, StoreOptions::default());
    let snapshot = store.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.content.to_text(), "hello world!");
}

#[tokio::test]
async fn test_corrupted_entries_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let id = DocumentId::from("fragile");

    {
        let rocks = open_rocks(&path);
        rocks
            .save_record(&id, &DocumentRecord::new(Snapshot::empty()), None)
            .unwrap();
        append(&rocks, &id, 1, Delta::new().insert("a"));
        append(&rocks, &id, 2, Delta::new().retain(1).insert("b"));
        append(&rocks, &id, 3, Delta::new().retain(2).insert("c"));
    }

    // Overwrite entry 2 behind the store's back.
    {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(false);
        let db = rocksdb::DB::open_cf(&opts, &path, ["documents", "oplog"]).unwrap();
        let cf = db.cf_handle("oplog").unwrap();
        db.put_cf(cf, raw_oplog_key("fragile", 2), b"\x00garbage\xff").unwrap();
    }

    let store = open_store(&path, StoreOptions::default());
    let snapshot = store.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.content.to_text(), "a");

    // Nothing past the corruption is left to shadow new commits.
    let leftover = store.rocks().unwrap().load_entries_since(&id, 2).unwrap();
    assert!(leftover.is_empty());

    let commit = store
        .apply_operation(&id, 1, Delta::new().retain(1).insert("z"))
        .await
        .unwrap();
    assert_eq!(commit.version, 2);
    assert_eq!(store.snapshot(&id).await.unwrap().content.to_text(), "az");
}

#[tokio::test]
async fn test_history_rebuilt_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let id = DocumentId::from("window");
    let options = StoreOptions {
        history_limit: 2,
        snapshot_interval: 1,
    };

    {
        let store = open_store(&path, options.clone());
        for (base, text) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            store
                .apply_operation(&id, base as u64, Delta::new().insert(*text))
                .await
                .unwrap();
        }
        store.shutdown().await;
    }

    let store = open_store(&path, options);
    let too_old = store
        .apply_operation(&id, 1, Delta::new().insert("x"))
        .await;
    assert!(matches!(
        too_old,
        Err(SyncError::VersionConflictUnresolvable { base: 1, current: 5 })
    ));

    let commit = store
        .apply_operation(&id, 3, Delta::new().retain(3).insert("!"))
        .await
        .unwrap();
    assert_eq!(commit.version, 6);
    // Authored against "cba"; "d" and "e" landed in front since.
    assert_eq!(store.snapshot(&id).await.unwrap().content.to_text(), "edcba!");
}

#[tokio::test]
async fn test_multiple_documents_recover_independently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store = open_store(&path, StoreOptions::for_testing());
        for (i, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
            let id = DocumentId::from(*name);
            for round in 0..=i as u64 {
                store
                    .apply_operation(&id, round, Delta::new().insert(*name))
                    .await
                    .unwrap();
            }
        }
        store.shutdown().await;
    }

    let store = open_store(&path, StoreOptions::for_testing());
    let mut listed = store.rocks().unwrap().list_documents().unwrap();
    listed.sort();
    assert_eq!(
        listed,
        vec![
            DocumentId::from("alpha"),
            DocumentId::from("beta"),
            DocumentId::from("gamma")
        ]
    );
    for (i, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
        let snapshot = store.snapshot(&DocumentId::from(*name)).await.unwrap();
        assert_eq!(snapshot.version, i as u64 + 1);
        assert_eq!(snapshot.content.to_text(), name.repeat(i + 1));
    }
}

#[tokio::test]
async fn test_server_in_memory_mode_no_store() {
    let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
    assert!(server.store().rocks().is_none());
}

#[tokio::test]
async fn test_server_writes_record_when_room_empties() {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        storage_path: Some(dir.path().join("db")),
        snapshot_interval: 0,
        ..ServerConfig::for_testing()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let messages = [
        ClientMessage::Join {
            document_id: DocumentId::from("saved"),
        },
        ClientMessage::Edit {
            base_version: 0,
            delta: Delta::new().insert("persist me"),
        },
    ];
    for message in messages {
        ws.send(Message::Binary(message.encode().unwrap().into()))
            .await
            .unwrap();
    }

    // Snapshot, then the ack.
    let mut received = Vec::new();
    while received.len() < 2 {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = frame {
            received.push(ServerMessage::decode(&data).unwrap());
        }
    }
    assert_eq!(received[1], ServerMessage::EditAck { version: 1 });

    ws.close(None).await.unwrap();
    drop(ws);

    let id = DocumentId::from("saved");
    let rocks = server.store().rocks().unwrap().clone();
    timeout(Duration::from_secs(5), async {
        loop {
            let version = rocks.load_record(&id).unwrap().map(|r| r.version);
            if version == Some(1) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("record never written");

    let record = rocks.load_record(&id).unwrap().unwrap();
    assert_eq!(record.snapshot().content.to_text(), "persist me");
}
