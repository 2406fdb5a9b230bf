//! Room registry: which sessions are attached to which document.
//!
//! One authoritative map behind a single lock that is only held for map
//! updates and channel sends, never across an await. Every member owns an
//! unbounded outbound queue, so a broadcast never blocks on a slow peer.
//!
//! ```text
//!   "doc1" ─► Room { s1 ─► tx, s2 ─► tx, s3 ─► tx }
//!   "doc2" ─► Room { s4 ─► tx }
//!
//!   broadcast("doc1", exclude = s2, m)  ──►  s1, s3
//! ```
//!
//! Rooms appear on first join and disappear when their last member leaves.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::document::DocumentId;
use crate::protocol::ServerMessage;

/// Outbound queue of one session.
pub type SessionSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("room for document '{document}' is full ({max} members)")]
    RoomFull { document: DocumentId, max: usize },
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms_created: u64,
    pub rooms_removed: u64,
    pub messages_delivered: u64,
    pub members_pruned: u64,
}

#[derive(Default)]
struct Room {
    members: HashMap<Uuid, SessionSender>,
}

/// Lock-free counters, read through [`RoomRegistry::stats`].
#[derive(Default)]
struct AtomicRegistryStats {
    rooms_created: AtomicU64,
    rooms_removed: AtomicU64,
    messages_delivered: AtomicU64,
    members_pruned: AtomicU64,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<DocumentId, Room>>,
    max_members: usize,
    stats: AtomicRegistryStats,
}

impl RoomRegistry {
    /// `max_members` of 0 means unlimited.
    pub fn new(max_members: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_members,
            stats: AtomicRegistryStats::default(),
        }
    }

    /// Add a session to the document's room, creating the room if needed.
    /// Returns the member count after joining.
    pub fn join(
        &self,
        document: &DocumentId,
        session: Uuid,
        sender: SessionSender,
    ) -> Result<usize, RegistryError> {
        let mut rooms = self.rooms.write();
        let created = !rooms.contains_key(document);
        let room = rooms.entry(document.clone()).or_default();
        room.members.retain(|_, tx| !tx.is_closed());

        if self.max_members > 0
            && room.members.len() >= self.max_members
            && !room.members.contains_key(&session)
        {
            if room.members.is_empty() {
                rooms.remove(document);
            }
            return Err(RegistryError::RoomFull {
                document: document.clone(),
                max: self.max_members,
            });
        }

        room.members.insert(session, sender);
        let count = room.members.len();
        if created {
            self.stats.rooms_created.fetch_add(1, Ordering::Relaxed);
            log::info!("Room '{document}' created");
        }
        Ok(count)
    }

    /// Remove a session. Returns true when this removed the room itself.
    pub fn leave(&self, document: &DocumentId, session: Uuid) -> bool {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get_mut(document) else {
            return false;
        };
        room.members.remove(&session);
        if room.members.is_empty() {
            rooms.remove(document);
            self.stats.rooms_removed.fetch_add(1, Ordering::Relaxed);
            log::info!("Room '{document}' removed (empty)");
            return true;
        }
        false
    }

    /// Deliver to every member except `exclude`. Returns deliveries made.
    pub fn broadcast(
        &self,
        document: &DocumentId,
        exclude: Option<Uuid>,
        message: &ServerMessage,
    ) -> usize {
        let mut closed = Vec::new();
        let delivered = {
            let rooms = self.rooms.read();
            let Some(room) = rooms.get(document) else {
                return 0;
            };
            let mut delivered = 0;
            for (id, tx) in &room.members {
                if Some(*id) == exclude {
                    continue;
                }
                if tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
            delivered
        };

        if !closed.is_empty() {
            self.prune(document, &closed);
        }
        self.stats
            .messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Deliver to one member. Returns false if it is not in the room.
    pub fn send_to(&self, document: &DocumentId, session: Uuid, message: ServerMessage) -> bool {
        let rooms = self.rooms.read();
        let sent = rooms
            .get(document)
            .and_then(|room| room.members.get(&session))
            .is_some_and(|tx| tx.send(message).is_ok());
        if sent {
            self.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    pub fn member_count(&self, document: &DocumentId) -> usize {
        self.rooms
            .read()
            .get(document)
            .map_or(0, |room| room.members.len())
    }

    pub fn contains(&self, document: &DocumentId, session: Uuid) -> bool {
        self.rooms
            .read()
            .get(document)
            .is_some_and(|room| room.members.contains_key(&session))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().keys().cloned().collect()
    }

    pub fn max_members(&self) -> usize {
        self.max_members
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms_created: self.stats.rooms_created.load(Ordering::Relaxed),
            rooms_removed: self.stats.rooms_removed.load(Ordering::Relaxed),
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            members_pruned: self.stats.members_pruned.load(Ordering::Relaxed),
        }
    }

    /// Drop members whose receiver is gone. The room itself is left to the
    /// owning session's `leave`, which reports emptiness to the caller.
    fn prune(&self, document: &DocumentId, closed: &[Uuid]) {
        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get_mut(document) {
            for id in closed {
                if room.members.get(id).is_some_and(|tx| tx.is_closed()) {
                    room.members.remove(id);
                    self.stats.members_pruned.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Pruned closed session {id} from room '{document}'");
                }
            }
        }
    }
}
