//! In-memory document model.
//!
//! ```text
//!   v0 ──δ1──► v1 ──δ2──► v2 ──δ3──► v3   (Document: content + version)
//!              └──────── History ───────┘  (last N commits, for rebasing)
//! ```
//!
//! A submission authored at an older version is rebased by transforming it
//! against every commit after its base. Committed operations win insert
//! ties, so earlier writers keep their position.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::delta::{CodecError, Delta};
use crate::error::SyncError;

/// Longest document identifier accepted, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 1024;

/// Identifier of a shared document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Non-empty and at most [`MAX_DOCUMENT_ID_LEN`] bytes.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_DOCUMENT_ID_LEN
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Full content plus the version it reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub content: Delta,
    pub version: u64,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            content: Delta::new(),
            version: 0,
        }
    }
}

/// An operation as committed at `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub version: u64,
    pub delta: Delta,
}

/// Authoritative state of one document.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    content: Delta,
    version: u64,
}

impl Document {
    /// Empty document at version 0.
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            content: Delta::new(),
            version: 0,
        }
    }

    pub fn from_snapshot(id: DocumentId, snapshot: Snapshot) -> Self {
        Self {
            id,
            content: snapshot.content,
            version: snapshot.version,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn content(&self) -> &Delta {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: self.content.clone(),
            version: self.version,
        }
    }

    /// Apply an operation authored against the current version.
    ///
    /// On failure neither content nor version change.
    pub fn apply(&mut self, delta: Delta) -> Result<Commit, CodecError> {
        self.apply_with(delta, |_| Ok(()))
    }

    /// Apply, calling `persist` with the commit before it becomes visible.
    /// A `persist` failure leaves the document untouched.
    pub fn apply_with<E, F>(&mut self, delta: Delta, persist: F) -> Result<Commit, E>
    where
        E: From<CodecError>,
        F: FnOnce(&Commit) -> Result<(), E>,
    {
        let content = delta.apply(&self.content)?;
        let commit = Commit {
            version: self.version + 1,
            delta,
        };
        persist(&commit)?;
        self.content = content;
        self.version = commit.version;
        Ok(commit)
    }
}

/// Bounded window of recent commits.
#[derive(Debug, Clone)]
pub struct History {
    limit: usize,
    commits: VecDeque<Commit>,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            commits: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Record a commit, evicting the oldest beyond the limit.
    pub fn push(&mut self, commit: Commit) {
        if self.limit == 0 {
            return;
        }
        if self.commits.len() == self.limit {
            self.commits.pop_front();
        }
        self.commits.push_back(commit);
    }

    /// Oldest base version a submission may still be rebased from.
    pub fn oldest_base(&self, current: u64) -> u64 {
        match self.commits.front() {
            Some(first) => first.version - 1,
            None => current,
        }
    }

    /// Commits after `base`, oldest first.
    pub fn since(&self, base: u64) -> impl Iterator<Item = &Commit> {
        self.commits.iter().filter(move |c| c.version > base)
    }

    /// Rewrite `delta`, authored at `base`, so it applies at `current`.
    pub fn rebase(&self, base: u64, current: u64, delta: Delta) -> Result<Delta, SyncError> {
        if base == current {
            return Ok(delta);
        }
        if base > current || base < self.oldest_base(current) {
            return Err(SyncError::VersionConflictUnresolvable { base, current });
        }
        let rebased = self
            .since(base)
            .fold(delta, |op, commit| commit.delta.transform(&op, true));
        Ok(rebased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(doc: &mut Document, history: &mut History, delta: Delta) -> Commit {
        let c = doc.apply(delta).unwrap();
        history.push(c.clone());
        c
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = Document::new(DocumentId::from("doc1"));
        assert_eq!(doc.version(), 0);
        assert!(doc.is_empty());
        assert_eq!(doc.snapshot(), Snapshot::empty());
    }

    #[test]
    fn test_apply_bumps_version() {
        let mut doc = Document::new("doc1".into());
        let c = doc.apply(Delta::new().insert("hello")).unwrap();
        assert_eq!(c.version, 1);
        assert_eq!(doc.content().to_text(), "hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_failed_apply_leaves_document() {
        let mut doc = Document::new("doc1".into());
        doc.apply(Delta::new().insert("abc")).unwrap();
        assert!(doc.apply(Delta::new().retain(10).insert("x")).is_err());
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.content().to_text(), "abc");
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut doc = Document::new("d".into());
        let mut history = History::new(2);
        for _ in 0..3 {
            commit(&mut doc, &mut history, Delta::new().insert("x"));
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.oldest_base(doc.version()), 1);
        assert_eq!(history.since(0).count(), 2);
    }

    #[test]
    fn test_rebase_concurrent_insert() {
        let mut doc = Document::new("doc1".into());
        let mut history = History::new(16);
        commit(&mut doc, &mut history, Delta::new().insert("hello"));
        commit(&mut doc, &mut history, Delta::new().retain(5).insert(" world"));

        let stale = Delta::new().retain(5).insert("!!!");
        let rebased = history.rebase(1, doc.version(), stale).unwrap();
        assert_eq!(rebased, Delta::new().retain(11).insert("!!!"));
        doc.apply(rebased).unwrap();
        assert_eq!(doc.content().to_text(), "hello world!!!");
    }

    #[test]
    fn test_rebase_current_is_identity() {
        let history = History::new(4);
        let op = Delta::new().insert("a");
        assert_eq!(history.rebase(3, 3, op.clone()).unwrap(), op);
    }

    #[test]
    fn test_rebase_rejects_future_and_evicted_bases() {
        let mut doc = Document::new("d".into());
        let mut history = History::new(1);
        commit(&mut doc, &mut history, Delta::new().insert("a"));
        commit(&mut doc, &mut history, Delta::new().insert("b"));

        let future = history.rebase(5, doc.version(), Delta::new());
        assert_eq!(
            future,
            Err(SyncError::VersionConflictUnresolvable { base: 5, current: 2 })
        );

        let evicted = history.rebase(0, doc.version(), Delta::new().insert("z"));
        assert!(matches!(
            evicted,
            Err(SyncError::VersionConflictUnresolvable { base: 0, current: 2 })
        ));
        assert!(history.rebase(1, doc.version(), Delta::new().insert("z")).is_ok());
    }

    #[test]
    fn test_document_id_validation() {
        assert!(DocumentId::from("doc1").is_valid());
        assert!(!DocumentId::from("").is_valid());
        assert!(!DocumentId::new("x".repeat(MAX_DOCUMENT_ID_LEN + 1)).is_valid());
    }
}
