//! Per-connection protocol state machine.
//!
//! ```text
//!  Connecting ──open()──► AwaitingDocumentRequest ──Join──► LoadingDocument
//!                                ▲                              │
//!                                └──── load failed / full ──────┤
//!                                                               ▼
//!  Closed ◄──────────── close() from any state ──────────── Synchronized
//!                                                        (Edit, Ping)
//! ```
//!
//! The session never touches the transport. Everything it wants to send
//! goes through its outbound queue, which the server drains into the
//! socket. Registration in the room and delivery of the snapshot happen
//! inside the document actor, so the snapshot always precedes the first
//! broadcast this session sees.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::delta::Delta;
use crate::document::DocumentId;
use crate::error::SyncError;
use crate::protocol::{ClientMessage, RejectReason, ServerMessage};
use crate::registry::{RoomRegistry, SessionSender};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingDocumentRequest,
    LoadingDocument,
    Synchronized,
    Closed,
}

/// Counters shared by all sessions of a server.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub applied_operations: AtomicU64,
    pub rejected_operations: AtomicU64,
}

pub struct Session {
    id: Uuid,
    state: SessionState,
    document: Option<DocumentId>,
    outbound: SessionSender,
    store: DocumentStore,
    registry: Arc<RoomRegistry>,
    metrics: Arc<SyncMetrics>,
}

impl Session {
    /// New session in `Connecting`, plus the queue of messages it emits.
    pub fn new(
        store: DocumentStore,
        registry: Arc<RoomRegistry>,
        metrics: Arc<SyncMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            document: None,
            outbound,
            store,
            registry,
            metrics,
        };
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document(&self) -> Option<&DocumentId> {
        self.document.as_ref()
    }

    /// The transport is established.
    pub fn open(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::AwaitingDocumentRequest;
        }
    }

    /// Decode and handle one binary frame.
    pub async fn handle_frame(&mut self, bytes: &[u8]) {
        if self.state == SessionState::Closed {
            return;
        }
        self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        match ClientMessage::decode(bytes) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                log::warn!("Session {}: undecodable frame: {e}", self.id);
                self.reject_malformed(e.to_string());
            }
        }
    }

    /// Report a frame that could not be understood.
    pub fn reject_malformed(&mut self, message: impl Into<String>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.metrics.rejected_operations.fetch_add(1, Ordering::Relaxed);
        self.send(ServerMessage::EditRejected {
            reason: RejectReason::Malformed,
            message: message.into(),
        });
    }

    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Join { document_id } => self.join(document_id).await,
            ClientMessage::Edit {
                base_version,
                delta,
            } => self.edit(base_version, delta).await,
            ClientMessage::Ping => {
                if self.state != SessionState::Closed {
                    self.send(ServerMessage::Pong);
                }
            }
        }
    }

    async fn join(&mut self, document_id: DocumentId) {
        match self.state {
            SessionState::AwaitingDocumentRequest => {}
            SessionState::Closed => return,
            SessionState::Connecting => {
                return self.join_failed(RejectReason::NotSynchronized, "connection not open");
            }
            SessionState::LoadingDocument | SessionState::Synchronized => {
                return self.join_failed(
                    RejectReason::AlreadyJoined,
                    "this connection already joined a document",
                );
            }
        }
        if !document_id.is_valid() {
            return self.join_failed(RejectReason::Malformed, "invalid document id");
        }

        self.state = SessionState::LoadingDocument;

        let registry = self.registry.clone();
        let outbound = self.outbound.clone();
        let session = self.id;
        let room = document_id.clone();
        let result = self
            .store
            .snapshot_then(&document_id, move |snapshot| {
                registry.join(&room, session, outbound.clone())?;
                let _ = outbound.send(ServerMessage::snapshot(snapshot));
                Ok(())
            })
            .await;

        match result {
            Ok(snapshot) => {
                log::info!(
                    "Session {} joined '{document_id}' at version {}",
                    self.id,
                    snapshot.version
                );
                self.document = Some(document_id);
                self.state = SessionState::Synchronized;
            }
            Err(e) => {
                log::warn!("Session {} failed to join '{document_id}': {e}", self.id);
                self.state = SessionState::AwaitingDocumentRequest;
                self.join_failed(e.reason(), e.to_string());
            }
        }
    }

    async fn edit(&mut self, base_version: u64, delta: Delta) {
        if self.state == SessionState::Closed {
            return;
        }
        let document = match (self.state, self.document.clone()) {
            (SessionState::Synchronized, Some(document)) => document,
            _ => return self.reject(SyncError::NotSynchronized),
        };

        let delta = match delta.try_normalized() {
            Ok(delta) => delta,
            Err(e) => {
                log::warn!("Session {} sent an unusable edit for '{document}': {e}", self.id);
                return self.reject(e.into());
            }
        };

        let registry = self.registry.clone();
        let outbound = self.outbound.clone();
        let session = self.id;
        let room = document.clone();
        let result = self
            .store
            .apply_operation_then(&document, base_version, delta, move |commit| {
                let _ = outbound.send(ServerMessage::EditAck {
                    version: commit.version,
                });
                let applied = ServerMessage::EditApplied {
                    delta: commit.delta.clone(),
                    version: commit.version,
                };
                registry.broadcast(&room, Some(session), &applied);
            })
            .await;

        match result {
            Ok(commit) => {
                self.metrics.applied_operations.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Session {} committed '{document}' v{} (base {base_version})",
                    self.id,
                    commit.version
                );
            }
            Err(e) => {
                log::warn!("Session {} edit on '{document}' rejected: {e}", self.id);
                self.reject(e);
            }
        }
    }

    /// Leave the room and release the document when the room emptied.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(document) = self.document.take() {
            let room_removed = self.registry.leave(&document, self.id);
            if room_removed {
                self.store.unload(&document).await;
            }
            log::info!("Session {} left '{document}'", self.id);
        }
        self.state = SessionState::Closed;
    }

    fn reject(&mut self, error: SyncError) {
        self.metrics.rejected_operations.fetch_add(1, Ordering::Relaxed);
        self.send(ServerMessage::EditRejected {
            reason: error.reason(),
            message: error.to_string(),
        });
    }

    fn join_failed(&mut self, reason: RejectReason, message: impl Into<String>) {
        self.send(ServerMessage::JoinFailed {
            reason,
            message: message.into(),
        });
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            log::debug!("Session {}: outbound queue closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{attrs, Op};
    use crate::store::StoreOptions;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        store: DocumentStore,
        registry: Arc<RoomRegistry>,
        metrics: Arc<SyncMetrics>,
    }

    impl Harness {
        fn new(max_members: usize) -> Self {
            Self {
                store: DocumentStore::in_memory(StoreOptions::default()),
                registry: Arc::new(RoomRegistry::new(max_members)),
                metrics: Arc::new(SyncMetrics::default()),
            }
        }

        fn session(&self) -> (Session, UnboundedReceiver<ServerMessage>) {
            let (mut session, rx) =
                Session::new(self.store.clone(), self.registry.clone(), self.metrics.clone());
            session.open();
            (session, rx)
        }
    }

    fn join(id: &str) -> ClientMessage {
        ClientMessage::Join {
            document_id: DocumentId::from(id),
        }
    }

    fn edit(base_version: u64, delta: Delta) -> ClientMessage {
        ClientMessage::Edit {
            base_version,
            delta,
        }
    }

    #[tokio::test]
    async fn test_open_transitions() {
        let h = Harness::new(0);
        let (mut session, _rx) =
            Session::new(h.store.clone(), h.registry.clone(), h.metrics.clone());
        assert_eq!(session.state(), SessionState::Connecting);
        session.open();
        assert_eq!(session.state(), SessionState::AwaitingDocumentRequest);
    }

    #[tokio::test]
    async fn test_join_delivers_snapshot_once() {
        let h = Harness::new(0);
        let (mut a, mut rx) = h.session();

        a.handle(join("doc1")).await;
        assert_eq!(a.state(), SessionState::Synchronized);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::Snapshot {
                content: Delta::new(),
                version: 0
            }
        );

        a.handle(join("doc1")).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::JoinFailed {
                reason: RejectReason::AlreadyJoined,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_edit_before_join_rejected() {
        let h = Harness::new(0);
        let (mut a, mut rx) = h.session();
        a.handle(edit(0, Delta::new().insert("x"))).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::EditRejected {
                reason: RejectReason::NotSynchronized,
                ..
            }
        ));
        assert_eq!(h.metrics.rejected_operations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_edit_acks_origin_and_broadcasts_to_others() {
        let h = Harness::new(0);
        let (mut a, mut rx_a) = h.session();
        let (mut b, mut rx_b) = h.session();
        a.handle(join("doc1")).await;
        b.handle(join("doc1")).await;
        let _ = rx_a.try_recv();
        let _ = rx_b.try_recv();

        a.handle(edit(0, Delta::new().insert("hello"))).await;
        assert_eq!(rx_a.try_recv().unwrap(), ServerMessage::EditAck { version: 1 });
        assert!(rx_a.try_recv().is_err());
        assert_eq!(
            rx_b.try_recv().unwrap(),
            ServerMessage::EditApplied {
                delta: Delta::new().insert("hello"),
                version: 1
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_range_edit_rejected_without_version_change() {
        let h = Harness::new(0);
        let (mut a, mut rx) = h.session();
        a.handle(join("doc1")).await;
        let _ = rx.try_recv();

        a.handle(edit(0, Delta::new().retain(3).insert("x"))).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::EditRejected {
                reason: RejectReason::OutOfRange,
                ..
            }
        ));
        assert_eq!(a.state(), SessionState::Synchronized);
        let snapshot = h.store.snapshot(&DocumentId::from("doc1")).await.unwrap();
        assert_eq!(snapshot.version, 0);
    }

    #[tokio::test]
    async fn test_overflowing_edit_rejected_and_room_survives() {
        let h = Harness::new(0);
        let (mut a, mut rx) = h.session();
        a.handle(join("doc1")).await;
        let _ = rx.try_recv();
        a.handle(edit(0, Delta::new().insert("hello"))).await;
        let _ = rx.try_recv();

        let overflowing = Delta::from_ops([
            Op::retain(usize::MAX),
            Op::Retain {
                count: 1,
                attributes: attrs([("bold", true)]),
            },
        ]);
        a.handle(edit(1, overflowing)).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::EditRejected {
                reason: RejectReason::Malformed,
                ..
            }
        ));

        // saturates instead of wrapping, so it can never fit
        a.handle(edit(1, Delta::new().retain(usize::MAX).retain(1).insert("x")))
            .await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::EditRejected {
                reason: RejectReason::OutOfRange,
                ..
            }
        ));

        a.handle(edit(1, Delta::new().retain(5).insert("!"))).await;
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::EditAck { version: 2 });
        let snapshot = h.store.snapshot(&DocumentId::from("doc1")).await.unwrap();
        assert_eq!(snapshot.content.to_text(), "hello!");
        assert!(snapshot.content.is_document());
    }

    #[tokio::test]
    async fn test_join_store_unavailable_then_retry() {
        let h = Harness::new(0);
        let broken = DocumentId::from("broken");
        let failed = h
            .store
            .apply_operation_then(&broken, 0, Delta::new().insert("x"), |_| {
                panic!("hook failure");
            })
            .await;
        assert!(matches!(failed, Err(SyncError::StoreUnavailable(_))));

        let (mut a, mut rx) = h.session();
        a.handle(join("broken")).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::JoinFailed {
                reason: RejectReason::StoreUnavailable,
                ..
            }
        ));
        assert_eq!(a.state(), SessionState::AwaitingDocumentRequest);
        assert_eq!(h.registry.member_count(&broken), 0);

        a.handle(join("doc1")).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Snapshot { version: 0, .. }
        ));
        assert_eq!(a.state(), SessionState::Synchronized);
    }

    #[tokio::test]
    async fn test_empty_room_drops_untouched_document() {
        let h = Harness::new(0);
        let (mut a, _rx_a) = h.session();
        a.handle(join("scratch")).await;
        a.close().await;
        assert!(!h.store.is_loaded(&DocumentId::from("scratch")));

        let (mut b, _rx_b) = h.session();
        b.handle(join("kept")).await;
        b.handle(edit(0, Delta::new().insert("x"))).await;
        b.close().await;
        assert!(h.store.is_loaded(&DocumentId::from("kept")));
        let snapshot = h.store.snapshot(&DocumentId::from("kept")).await.unwrap();
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let h = Harness::new(0);
        let (mut a, mut rx) = h.session();
        a.handle_frame(&[0xFF, 0x00, 0x13]).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::EditRejected {
                reason: RejectReason::Malformed,
                ..
            }
        ));
        assert_eq!(a.state(), SessionState::AwaitingDocumentRequest);
        assert_eq!(h.metrics.bytes_received.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_room_full_returns_to_awaiting() {
        let h = Harness::new(1);
        let (mut a, _rx_a) = h.session();
        let (mut b, mut rx_b) = h.session();
        a.handle(join("doc1")).await;
        b.handle(join("doc1")).await;

        assert_eq!(b.state(), SessionState::AwaitingDocumentRequest);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerMessage::JoinFailed {
                reason: RejectReason::RoomFull,
                ..
            }
        ));

        b.handle(join("doc2")).await;
        assert_eq!(b.state(), SessionState::Synchronized);
    }

    #[tokio::test]
    async fn test_invalid_document_id() {
        let h = Harness::new(0);
        let (mut a, mut rx) = h.session();
        a.handle(join("")).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::JoinFailed {
                reason: RejectReason::Malformed,
                ..
            }
        ));
        assert_eq!(a.state(), SessionState::AwaitingDocumentRequest);
    }

    #[tokio::test]
    async fn test_close_leaves_room() {
        let h = Harness::new(0);
        let (mut a, _rx) = h.session();
        a.handle(join("doc1")).await;
        assert_eq!(h.registry.member_count(&DocumentId::from("doc1")), 1);

        a.close().await;
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(h.registry.room_count(), 0);

        a.handle(ClientMessage::Ping).await;
        a.handle(edit(0, Delta::new().insert("x"))).await;
        assert_eq!(h.metrics.rejected_operations.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let h = Harness::new(0);
        let (mut a, mut rx) = h.session();
        a.handle(ClientMessage::Ping).await;
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);
    }
}
