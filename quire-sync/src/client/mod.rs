//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Local edit submission with at most one operation in flight
//! - Remote operations rebased onto pending local edits
//!
//! ```text
//!  editor ── submit() ──► ClientDocument ── outgoing ──► writer task ──► ws
//!    ▲                          ▲                                        │
//!    └──── SyncEvent ◄──────────┴────────────── reader task ◄────────────┘
//! ```
//!
//! Reference: Kleppmann, Chapter 5 — Replication

pub mod state;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::delta::Delta;
use crate::document::{DocumentId, Snapshot};
use crate::error::SyncError;
use crate::protocol::{ClientMessage, RejectReason, ServerMessage};

pub use state::{ClientDocument, PendingState};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, waiting for (or without) a snapshot.
    Connected,
    /// Snapshot received; edits are accepted.
    Synchronized,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Initial snapshot received; editing may begin
    Loaded { content: Delta, version: u64 },
    /// Another client's edit, already applied to the local copy
    Remote { delta: Delta, version: u64 },
    /// Our in-flight edit was committed
    Acknowledged { version: u64 },
    /// A join or edit was refused.
    ///
    /// The local copy and any unacknowledged edits are discarded for every
    /// reason, transient ones like `StoreUnavailable` included, and
    /// [`SyncClient::submit`] fails with `NotSynchronized` until
    /// [`SyncClient::reconnect`] has delivered a fresh `Loaded`. Edits the
    /// application still wants must be re-derived from that snapshot.
    Rejected { reason: RejectReason, message: String },
    /// Connection lost
    Disconnected,
}

struct Inner {
    state: ConnectionState,
    document: Option<ClientDocument>,
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
}

impl Inner {
    fn send(&self, message: ClientMessage) -> Result<(), SyncError> {
        match &self.outgoing {
            Some(tx) => tx.send(message).map_err(|_| SyncError::ConnectionLost),
            None => Err(SyncError::ConnectionLost),
        }
    }

    fn reset(&mut self) {
        self.document = None;
        if self.state == ConnectionState::Synchronized {
            self.state = ConnectionState::Connected;
        }
    }
}

/// One editing session against one document.
pub struct SyncClient {
    url: String,
    document_id: DocumentId,
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Connect to `url` and join `document_id`. The snapshot arrives later
    /// as [`SyncEvent::Loaded`].
    pub async fn connect(
        url: impl Into<String>,
        document_id: impl Into<DocumentId>,
    ) -> Result<Self, SyncError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut client = Self {
            url: url.into(),
            document_id: document_id.into(),
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                document: None,
                outgoing: None,
            })),
            event_tx,
            event_rx: Some(event_rx),
            tasks: Vec::new(),
        };
        client.start().await?;
        Ok(client)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    async fn start(&mut self) -> Result<(), SyncError> {
        self.inner.lock().state = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.url);
                self.inner.lock().state = ConnectionState::Disconnected;
                return Err(SyncError::ConnectionLost);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Writer task: forward outgoing messages, close the socket when the
        // sender is dropped.
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let encoded = match message.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode client message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Connected;
            inner.document = None;
            inner.outgoing = Some(out_tx);
            inner.send(ClientMessage::Join {
                document_id: self.document_id.clone(),
            })?;
        }

        let inner = self.inner.clone();
        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(message) => handle_server_message(&inner, &event_tx, message),
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            {
                let mut inner = inner.lock();
                inner.state = ConnectionState::Disconnected;
                inner.outgoing = None;
            }
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        self.tasks = vec![writer, reader];
        log::info!("Connected to {} for '{}'", self.url, self.document_id);
        Ok(())
    }

    /// Submit a local edit against the current local content.
    pub fn submit(&self, delta: Delta) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Synchronized {
            return Err(SyncError::NotSynchronized);
        }
        let Some(document) = inner.document.as_mut() else {
            return Err(SyncError::NotSynchronized);
        };
        if let Some((base_version, delta)) = document.apply_local(delta)? {
            inner.send(ClientMessage::Edit {
                base_version,
                delta,
            })?;
        }
        Ok(())
    }

    /// Send a keepalive ping.
    pub fn ping(&self) -> Result<(), SyncError> {
        self.inner.lock().send(ClientMessage::Ping)
    }

    /// Drop the current connection and join again from a fresh snapshot.
    /// Unacknowledged local edits are discarded.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        self.abort_tasks();
        self.inner.lock().outgoing = None;
        self.start().await
    }

    /// Close the connection and stop the background tasks.
    pub async fn disconnect(&mut self) {
        let was_connected = {
            let mut inner = self.inner.lock();
            inner.outgoing = None;
            inner.document = None;
            std::mem::replace(&mut inner.state, ConnectionState::Disconnected)
                != ConnectionState::Disconnected
        };
        let mut tasks = std::mem::take(&mut self.tasks);
        if let Some(reader) = tasks.pop() {
            reader.abort();
        }
        // The writer sends a close frame once its queue is dropped.
        if let Some(writer) = tasks.pop() {
            let _ = writer.await;
        }
        if was_connected {
            let _ = self.event_tx.send(SyncEvent::Disconnected);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.url
    }

    /// Local content, once the snapshot has arrived.
    pub fn content(&self) -> Option<Delta> {
        self.inner
            .lock()
            .document
            .as_ref()
            .map(|doc| doc.content().clone())
    }

    pub fn text(&self) -> Option<String> {
        self.inner.lock().document.as_ref().map(ClientDocument::text)
    }

    pub fn version(&self) -> Option<u64> {
        self.inner.lock().document.as_ref().map(ClientDocument::version)
    }

    pub fn has_pending(&self) -> bool {
        self.inner
            .lock()
            .document
            .as_ref()
            .is_some_and(ClientDocument::has_pending)
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Apply one server message to the shared client state. Runs under the
/// state lock so a buffered edit is sent before any later submission.
fn handle_server_message(
    inner: &Mutex<Inner>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    message: ServerMessage,
) {
    let mut inner = inner.lock();
    let event = match message {
        ServerMessage::Snapshot { content, version } => {
            if inner.document.is_some() {
                log::warn!("Ignoring repeated snapshot at version {version}");
                return;
            }
            inner.document = Some(ClientDocument::from_snapshot(Snapshot {
                content: content.clone(),
                version,
            }));
            inner.state = ConnectionState::Synchronized;
            SyncEvent::Loaded { content, version }
        }
        ServerMessage::EditApplied { delta, version } => {
            let Some(document) = inner.document.as_mut() else {
                log::debug!("Dropping remote edit v{version} while unsynchronized");
                return;
            };
            match document.apply_remote(delta, version) {
                Ok(delta) => SyncEvent::Remote { delta, version },
                Err(e) => {
                    log::error!("Remote edit v{version} does not apply locally: {e}");
                    inner.reset();
                    SyncEvent::Rejected {
                        reason: RejectReason::OutOfRange,
                        message: e.to_string(),
                    }
                }
            }
        }
        ServerMessage::EditAck { version } => {
            let Some(document) = inner.document.as_mut() else {
                return;
            };
            if let Some((base_version, delta)) = document.acknowledge(version) {
                if let Err(e) = inner.send(ClientMessage::Edit {
                    base_version,
                    delta,
                }) {
                    log::warn!("Failed to send buffered edit: {e}");
                }
            }
            SyncEvent::Acknowledged { version }
        }
        ServerMessage::EditRejected { reason, message } => {
            log::warn!("Edit rejected ({reason:?}): {message}");
            inner.reset();
            SyncEvent::Rejected { reason, message }
        }
        ServerMessage::JoinFailed { reason, message } => {
            log::warn!("Join failed ({reason:?}): {message}");
            inner.reset();
            SyncEvent::Rejected { reason, message }
        }
        ServerMessage::Pong => {
            log::debug!("Pong");
            return;
        }
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (Mutex<Inner>, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Mutex::new(Inner {
            state: ConnectionState::Connected,
            document: None,
            outgoing: Some(tx),
        });
        (inner, rx)
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = SyncClient::connect(format!("ws://127.0.0.1:{port}"), "doc").await;
        assert!(matches!(result, Err(SyncError::ConnectionLost)));
    }

    #[test]
    fn test_snapshot_enables_editing() {
        let (inner, _rx) = state();
        let (events, mut event_rx) = mpsc::unbounded_channel();

        handle_server_message(
            &inner,
            &events,
            ServerMessage::Snapshot {
                content: Delta::from_text("hi"),
                version: 2,
            },
        );
        assert_eq!(inner.lock().state, ConnectionState::Synchronized);
        assert_eq!(
            event_rx.try_recv().unwrap(),
            SyncEvent::Loaded {
                content: Delta::from_text("hi"),
                version: 2
            }
        );
    }

    #[test]
    fn test_ack_flushes_buffer() {
        let (inner, mut rx) = state();
        let (events, mut event_rx) = mpsc::unbounded_channel();
        {
            let mut guard = inner.lock();
            let mut doc = ClientDocument::from_snapshot(Snapshot::empty());
            doc.apply_local(Delta::new().insert("a")).unwrap();
            doc.apply_local(Delta::new().retain(1).insert("b")).unwrap();
            guard.document = Some(doc);
            guard.state = ConnectionState::Synchronized;
        }

        handle_server_message(&inner, &events, ServerMessage::EditAck { version: 1 });
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::Edit {
                base_version: 1,
                delta: Delta::new().retain(1).insert("b"),
            }
        );
        assert_eq!(
            event_rx.try_recv().unwrap(),
            SyncEvent::Acknowledged { version: 1 }
        );
    }

    #[test]
    fn test_rejection_discards_local_copy() {
        let (inner, _rx) = state();
        let (events, mut event_rx) = mpsc::unbounded_channel();
        {
            let mut guard = inner.lock();
            guard.document = Some(ClientDocument::from_snapshot(Snapshot::empty()));
            guard.state = ConnectionState::Synchronized;
        }

        handle_server_message(
            &inner,
            &events,
            ServerMessage::EditRejected {
                reason: RejectReason::VersionConflict,
                message: "stale".into(),
            },
        );
        let guard = inner.lock();
        assert!(guard.document.is_none());
        assert_eq!(guard.state, ConnectionState::Connected);
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            SyncEvent::Rejected {
                reason: RejectReason::VersionConflict,
                ..
            }
        ));
    }

    #[test]
    fn test_remote_before_snapshot_is_dropped() {
        let (inner, _rx) = state();
        let (events, mut event_rx) = mpsc::unbounded_channel();
        handle_server_message(
            &inner,
            &events,
            ServerMessage::EditApplied {
                delta: Delta::new().insert("x"),
                version: 1,
            },
        );
        assert!(event_rx.try_recv().is_err());
    }
}
