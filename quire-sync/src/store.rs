//! Document store: one single-writer actor per loaded document.
//!
//! ```text
//!   session A ──┐                 ┌──────────────────────────────┐
//!   session B ──┼── mpsc ───────► │ actor("doc1")                │
//!   session C ──┘  (Command)      │  Document + History          │
//!                                 │  rebase → apply → op log     │
//!                                 │  → hook (ack + broadcast)    │
//!                                 └──────────────┬───────────────┘
//!   session D ───── mpsc ───────► actor("doc2")  │ RocksStore
//! ```
//!
//! Operations on one document are totally ordered by its mailbox; different
//! documents proceed in parallel. Hooks run inside the actor, after the
//! commit is durable and before the next command, so anything they send
//! is observed in commit order.
//!
//! Reference: Kleppmann — DDIA, Chapter 9 (Total Order Broadcast)

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::delta::Delta;
use crate::document::{Commit, Document, DocumentId, History, Snapshot};
use crate::error::{Result, SyncError};
use crate::storage::{DocumentRecord, OpLogEntry, RocksStore};

/// Runs inside the document actor once a commit is durable.
pub type CommitHook = Box<dyn FnOnce(&Commit) + Send>;

/// Runs inside the document actor with the snapshot being returned. An
/// error fails the whole call.
pub type SnapshotHook = Box<dyn FnOnce(&Snapshot) -> Result<()> + Send>;

/// Unregisters a retiring actor so later commands reach a new one.
type ReleaseHook = Box<dyn FnOnce() + Send>;

const MAILBOX_CAPACITY: usize = 256;
const SEND_ATTEMPTS: usize = 3;

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Commits kept in memory for rebasing stale submissions
    pub history_limit: usize,
    /// Commits between full record writes (0 = only on unload)
    pub snapshot_interval: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            snapshot_interval: 100,
        }
    }
}

impl StoreOptions {
    pub fn for_testing() -> Self {
        Self {
            history_limit: 64,
            snapshot_interval: 4,
        }
    }
}

enum Command {
    Snapshot {
        hook: Option<SnapshotHook>,
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Apply {
        base_version: u64,
        delta: Delta,
        hook: Option<CommitHook>,
        reply: oneshot::Sender<Result<Commit>>,
    },
    /// Stop if the document never left version 0.
    Retire {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

impl Command {
    fn fail(self, error: SyncError) {
        match self {
            Command::Snapshot { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Apply { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Retire { reply } => {
                let _ = reply.send(false);
            }
            Command::Shutdown => {}
        }
    }
}

struct Shared {
    durable: Option<Arc<RocksStore>>,
    options: StoreOptions,
    actors: RwLock<HashMap<DocumentId, mpsc::Sender<Command>>>,
    handles: Mutex<HashMap<DocumentId, JoinHandle<()>>>,
    /// Actors shutting down; the next actor for the id waits on them.
    retiring: Mutex<HashMap<DocumentId, JoinHandle<()>>>,
    /// In-memory documents whose actor died; their content is gone.
    lost: Mutex<HashSet<DocumentId>>,
}

/// Cheaply cloneable handle to the document actors.
#[derive(Clone)]
pub struct DocumentStore {
    shared: Arc<Shared>,
}

impl DocumentStore {
    /// Documents live only as long as their actor.
    pub fn in_memory(options: StoreOptions) -> Self {
        Self::with_backend(None, options)
    }

    /// Commits are written to `rocks` before they are acknowledged.
    pub fn durable(rocks: RocksStore, options: StoreOptions) -> Self {
        Self::with_backend(Some(Arc::new(rocks)), options)
    }

    fn with_backend(durable: Option<Arc<RocksStore>>, options: StoreOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                durable,
                options,
                actors: RwLock::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
                retiring: Mutex::new(HashMap::new()),
                lost: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.shared.durable.is_some()
    }

    pub fn options(&self) -> &StoreOptions {
        &self.shared.options
    }

    pub fn rocks(&self) -> Option<&Arc<RocksStore>> {
        self.shared.durable.as_ref()
    }

    /// Existing document, or a new empty one at version 0.
    pub async fn load_or_create(&self, id: &DocumentId) -> Result<Snapshot> {
        self.snapshot_inner(id, None).await
    }

    /// Current content and version.
    pub async fn snapshot(&self, id: &DocumentId) -> Result<Snapshot> {
        self.snapshot_inner(id, None).await
    }

    /// Snapshot, running `hook` in the document's serialised section.
    pub async fn snapshot_then<F>(&self, id: &DocumentId, hook: F) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<()> + Send + 'static,
    {
        self.snapshot_inner(id, Some(Box::new(hook))).await
    }

    async fn snapshot_inner(&self, id: &DocumentId, hook: Option<SnapshotHook>) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(id, Command::Snapshot { hook, reply }).await?;
        rx.await.map_err(|_| actor_gone(id))?
    }

    /// Rebase `delta` from `base_version` onto the current version and
    /// commit it. Returns the operation as committed.
    pub async fn apply_operation(
        &self,
        id: &DocumentId,
        base_version: u64,
        delta: Delta,
    ) -> Result<Commit> {
        self.apply_inner(id, base_version, delta, None).await
    }

    /// Like [`apply_operation`](Self::apply_operation), running `hook`
    /// with the commit before the next operation on this document.
    pub async fn apply_operation_then<F>(
        &self,
        id: &DocumentId,
        base_version: u64,
        delta: Delta,
        hook: F,
    ) -> Result<Commit>
    where
        F: FnOnce(&Commit) + Send + 'static,
    {
        self.apply_inner(id, base_version, delta, Some(Box::new(hook))).await
    }

    async fn apply_inner(
        &self,
        id: &DocumentId,
        base_version: u64,
        delta: Delta,
        hook: Option<CommitHook>,
    ) -> Result<Commit> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Apply {
            base_version,
            delta,
            hook,
            reply,
        };
        self.dispatch(id, command).await?;
        rx.await.map_err(|_| actor_gone(id))?
    }

    /// Retire the document's actor, writing a final record.
    ///
    /// In-memory documents stay resident once edited; an untouched one at
    /// version 0 is dropped. Returns whether an actor was retired.
    pub async fn unload(&self, id: &DocumentId) -> bool {
        if !self.is_durable() {
            return self.retire_pristine(id).await;
        }

        let sender = {
            let mut actors = self.shared.actors.write();
            let sender = actors.remove(id);
            let handle = self.shared.handles.lock().remove(id);
            if let Some(handle) = handle {
                let mut retiring = self.shared.retiring.lock();
                retiring.retain(|_, h| !h.is_finished());
                retiring.insert(id.clone(), handle);
            }
            sender
        };

        match sender {
            Some(sender) => {
                let sent = sender.send(Command::Shutdown).await.is_ok();
                if sent {
                    log::info!("Unloading document '{id}'");
                }
                sent
            }
            None => false,
        }
    }

    async fn retire_pristine(&self, id: &DocumentId) -> bool {
        let sender = self.shared.actors.read().get(id).cloned();
        let Some(sender) = sender else {
            return false;
        };
        let (reply, rx) = oneshot::channel();
        if sender.send(Command::Retire { reply }).await.is_err() {
            return false;
        }
        let retired = rx.await.unwrap_or(false);
        if retired {
            log::debug!("Dropped untouched in-memory document '{id}'");
        }
        retired
    }

    /// Ids with a live actor.
    pub fn loaded_documents(&self) -> Vec<DocumentId> {
        self.shared
            .actors
            .read()
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_loaded(&self, id: &DocumentId) -> bool {
        self.shared
            .actors
            .read()
            .get(id)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Retire every actor and wait until each has written its final record.
    pub async fn shutdown(&self) {
        let senders: Vec<_> = self.shared.actors.write().drain().collect();
        let mut handles: Vec<_> = self.shared.handles.lock().drain().map(|(_, h)| h).collect();
        handles.extend(self.shared.retiring.lock().drain().map(|(_, h)| h));

        for (id, sender) in senders {
            if sender.send(Command::Shutdown).await.is_err() {
                log::debug!("Actor for '{id}' already stopped");
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        log::info!("Document store shut down");
    }

    /// Deliver a command, replacing actors that stopped accepting.
    async fn dispatch(&self, id: &DocumentId, mut command: Command) -> Result<()> {
        for _ in 0..SEND_ATTEMPTS {
            let sender = match self.sender_for(id) {
                Ok(sender) => sender,
                Err(e) => {
                    command.fail(e.clone());
                    return Err(e);
                }
            };
            match sender.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    command = returned;
                    self.forget(id, &sender);
                }
            }
        }
        command.fail(actor_gone(id));
        Err(actor_gone(id))
    }

    fn sender_for(&self, id: &DocumentId) -> Result<mpsc::Sender<Command>> {
        {
            let actors = self.shared.actors.read();
            if let Some(sender) = actors.get(id) {
                if !sender.is_closed() {
                    return Ok(sender.clone());
                }
            }
        }

        let mut actors = self.shared.actors.write();
        if let Some(sender) = actors.get(id) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }
        if actors.remove(id).is_some() {
            self.reap(id);
        }
        if self.shared.lost.lock().contains(id) {
            return Err(document_lost(id));
        }

        let (sender, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let previous = self.shared.retiring.lock().remove(id);
        let task = tokio::spawn(run_actor(
            id.clone(),
            mailbox,
            previous,
            self.shared.durable.clone(),
            self.shared.options.clone(),
            self.release_hook(id, &sender),
        ));
        actors.insert(id.clone(), sender.clone());
        self.shared.handles.lock().insert(id.clone(), task);
        Ok(sender)
    }

    fn forget(&self, id: &DocumentId, stale: &mpsc::Sender<Command>) {
        let mut actors = self.shared.actors.write();
        if actors.get(id).is_some_and(|s| s.same_channel(stale)) {
            actors.remove(id);
            self.reap(id);
        }
    }

    /// Account for an actor that stopped while still registered. Durable
    /// documents reload from storage; in-memory ones are marked lost.
    /// Called with the actors lock held.
    fn reap(&self, id: &DocumentId) {
        let handle = self.shared.handles.lock().remove(id);
        let panicked = match handle {
            Some(handle) if handle.is_finished() => {
                matches!(handle.now_or_never(), Some(Err(e)) if e.is_panic())
            }
            Some(handle) => {
                self.shared.retiring.lock().insert(id.clone(), handle);
                false
            }
            None => false,
        };

        if self.is_durable() {
            log::warn!("Actor for '{id}' stopped (panicked: {panicked}); reloading from storage");
            return;
        }
        log::error!("In-memory document '{id}' lost its actor (panicked: {panicked})");
        self.shared.lost.lock().insert(id.clone());
    }

    fn release_hook(&self, id: &DocumentId, sender: &mpsc::Sender<Command>) -> ReleaseHook {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let registered = sender.downgrade();
        let id = id.clone();
        Box::new(move || {
            let (Some(shared), Some(registered)) = (shared.upgrade(), registered.upgrade()) else {
                return;
            };
            let mut actors = shared.actors.write();
            if actors.get(&id).is_some_and(|s| s.same_channel(&registered)) {
                actors.remove(&id);
                shared.handles.lock().remove(&id);
            }
        })
    }
}

fn actor_gone(id: &DocumentId) -> SyncError {
    SyncError::StoreUnavailable(format!("actor for document '{id}' stopped"))
}

fn document_lost(id: &DocumentId) -> SyncError {
    SyncError::StoreUnavailable(format!("in-memory document '{id}' was lost"))
}

/// State owned by one document actor.
struct DocumentActor {
    document: Document,
    history: History,
    durable: Option<Arc<RocksStore>>,
    record: Option<DocumentRecord>,
    snapshot_interval: u64,
    since_record: u64,
}

async fn run_actor(
    id: DocumentId,
    mut mailbox: mpsc::Receiver<Command>,
    previous: Option<JoinHandle<()>>,
    durable: Option<Arc<RocksStore>>,
    options: StoreOptions,
    release: ReleaseHook,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let mut actor = match DocumentActor::load(id.clone(), durable, &options) {
        Ok(actor) => actor,
        Err(e) => {
            log::error!("Failed to load document '{id}': {e}");
            mailbox.close();
            while let Some(command) = mailbox.recv().await {
                command.fail(e.clone());
            }
            return;
        }
    };

    let mut release = Some(release);
    while let Some(command) = mailbox.recv().await {
        match command {
            // queued behind a retirement; the next actor starts from scratch
            Command::Apply { reply, .. } if release.is_none() => {
                let _ = reply.send(Err(actor_gone(&id)));
            }
            Command::Snapshot { hook, reply } => {
                let snapshot = actor.document.snapshot();
                let result = match hook {
                    Some(hook) => hook(&snapshot).map(|()| snapshot),
                    None => Ok(snapshot),
                };
                let _ = reply.send(result);
            }
            Command::Apply {
                base_version,
                delta,
                hook,
                reply,
            } => {
                let result = actor.apply(base_version, delta);
                if let (Ok(commit), Some(hook)) = (&result, hook) {
                    hook(commit);
                }
                let _ = reply.send(result);
            }
            Command::Retire { reply } => {
                let pristine = actor.durable.is_none() && actor.document.version() == 0;
                if pristine {
                    if let Some(release) = release.take() {
                        release();
                    }
                    mailbox.close();
                }
                let _ = reply.send(pristine);
            }
            Command::Shutdown => {
                // finish what is already queued, refuse the rest
                mailbox.close();
            }
        }
    }

    actor.checkpoint();
    log::debug!("Actor for document '{id}' stopped at version {}", actor.document.version());
}

impl DocumentActor {
    /// Rebuild from storage: record, then the op-log tail.
    fn load(id: DocumentId, durable: Option<Arc<RocksStore>>, options: &StoreOptions) -> Result<Self> {
        let mut history = History::new(options.history_limit);

        let Some(rocks) = durable else {
            return Ok(Self {
                document: Document::new(id),
                history,
                durable: None,
                record: None,
                snapshot_interval: options.snapshot_interval,
                since_record: 0,
            });
        };

        let recovered = rocks.recover(&id)?;
        let mut document = match &recovered.record {
            Some(record) => Document::from_snapshot(id.clone(), record.snapshot()),
            None => Document::new(id.clone()),
        };
        for entry in &recovered.history {
            history.push(entry.commit());
        }

        let mut replayed = 0u64;
        let mut stopped_early = recovered.skipped > 0;
        for entry in recovered.entries {
            match document.apply(entry.delta) {
                Ok(commit) => {
                    history.push(commit);
                    replayed += 1;
                }
                Err(e) => {
                    log::warn!("Stopping replay of '{id}' at version {}: {e}", entry.version);
                    stopped_early = true;
                    break;
                }
            }
        }
        if stopped_early {
            let dropped = rocks.discard_after(&id, document.version())?;
            log::warn!(
                "Recovered '{id}' at version {} ({} op log entries discarded)",
                document.version(),
                dropped
            );
        }

        let mut actor = Self {
            document,
            history,
            durable: Some(rocks),
            record: recovered.record,
            snapshot_interval: options.snapshot_interval,
            since_record: replayed,
        };
        if actor.record.is_none() {
            actor.write_record()?;
        }

        log::info!(
            "Loaded document '{id}' at version {} ({replayed} replayed)",
            actor.document.version()
        );
        Ok(actor)
    }

    fn apply(&mut self, base_version: u64, delta: Delta) -> Result<Commit> {
        let delta = delta.try_normalized()?;
        let current = self.document.version();
        let op = self.history.rebase(base_version, current, delta).inspect_err(|e| {
            log::warn!("Rejecting edit on '{}': {e}", self.document.id());
        })?;

        let id = self.document.id().clone();
        let durable = self.durable.clone();
        let commit = self.document.apply_with(op, |commit| -> Result<()> {
            if let Some(rocks) = &durable {
                let entry = OpLogEntry::new(id.clone(), commit)?;
                rocks.append(&entry).inspect_err(|e| {
                    log::error!("Failed to append op log entry for '{id}': {e}");
                })?;
            }
            Ok(())
        })?;

        self.history.push(commit.clone());
        self.since_record += 1;
        if self.snapshot_interval > 0 && self.since_record >= self.snapshot_interval {
            self.checkpoint();
        }

        log::debug!("Committed '{}' v{}", self.document.id(), commit.version);
        Ok(commit)
    }

    /// Write a record if anything changed since the last one.
    fn checkpoint(&mut self) {
        if self.durable.is_none() || self.since_record == 0 {
            return;
        }
        if let Err(e) = self.write_record() {
            log::error!("Failed to write record for '{}': {e}", self.document.id());
        }
    }

    fn write_record(&mut self) -> Result<()> {
        let Some(rocks) = &self.durable else {
            return Ok(());
        };
        let snapshot = self.document.snapshot();
        let record = match &self.record {
            Some(previous) => previous.advance(snapshot),
            None => DocumentRecord::new(snapshot),
        };
        let limit = self.history.limit() as u64;
        let compact_through = record.version.checked_sub(limit).filter(|v| *v > 0);
        let removed = rocks.save_record(self.document.id(), &record, compact_through)?;
        if removed > 0 {
            log::debug!("Compacted {removed} op log entries for '{}'", self.document.id());
        }
        self.record = Some(record);
        self.since_record = 0;
        Ok(())
    }
}
