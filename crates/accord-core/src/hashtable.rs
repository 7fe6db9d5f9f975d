//! Per-member fingerprint tables: classify reports, infer deletions.
//!
//! A member is never trusted to know what changed. The engine keeps the
//! fingerprint of every record it saw in the last completed pass and
//! re-derives each report's classification here. An id that was present
//! last pass and is never reported this pass was deleted on the member;
//! [`HashTable::finalize_pass`] surfaces those.
//!
//! This is the in-memory working copy for one (member, category). Loading
//! and durable writes go through the store layer; within a pass all
//! classification happens here without I/O.

use std::collections::{HashMap, HashSet};

use crate::change::ChangeKind;
use crate::types::{Fingerprint, UniqueId};

/// Fingerprint table for one member and one category.
#[derive(Debug, Clone, Default)]
pub struct HashTable {
    entries: HashMap<UniqueId, Fingerprint>,
    seen: HashSet<UniqueId>,
}

impl HashTable {
    /// An empty table (first sync or after a slow-sync reset).
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the working copy from persisted entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (UniqueId, Fingerprint)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            seen: HashSet::new(),
        }
    }

    /// Classify one reported record and mark its id as seen in this pass.
    ///
    /// Absent id: Added. Present with a different fingerprint: Modified.
    /// Present with the same fingerprint: Unmodified.
    pub fn classify(&mut self, unique_id: &UniqueId, fingerprint: &Fingerprint) -> ChangeKind {
        self.seen.insert(unique_id.clone());
        match self.entries.get(unique_id) {
            None => ChangeKind::Added,
            Some(stored) if stored == fingerprint => ChangeKind::Unmodified,
            Some(_) => ChangeKind::Modified,
        }
    }

    /// Classify a member-reported deletion and mark the id as seen.
    ///
    /// Deleting an id we never stored is a no-op report (Unmodified); the
    /// record was already gone as far as the last pass is concerned.
    pub fn classify_deletion(&mut self, unique_id: &UniqueId) -> ChangeKind {
        self.seen.insert(unique_id.clone());
        if self.entries.contains_key(unique_id) {
            ChangeKind::Deleted
        } else {
            ChangeKind::Unmodified
        }
    }

    /// End the pass: every stored id that was never marked seen is an
    /// implicit deletion. Returns those ids (sorted, for deterministic
    /// planning), removes them from the table, and clears the seen set.
    pub fn finalize_pass(&mut self) -> Vec<UniqueId> {
        let mut deleted: Vec<UniqueId> = self
            .entries
            .keys()
            .filter(|id| !self.seen.contains(*id))
            .cloned()
            .collect();
        deleted.sort();
        for id in &deleted {
            self.entries.remove(id);
        }
        self.seen.clear();
        deleted
    }

    /// Store or overwrite a fingerprint after a successful propagation.
    /// The id counts as seen; a record we just wrote is present.
    pub fn commit(&mut self, unique_id: UniqueId, fingerprint: Fingerprint) {
        self.seen.insert(unique_id.clone());
        self.entries.insert(unique_id, fingerprint);
    }

    /// Remove an entry after a confirmed deletion.
    pub fn commit_delete(&mut self, unique_id: &UniqueId) {
        self.entries.remove(unique_id);
        self.seen.remove(unique_id);
    }

    /// Clear everything (slow-sync). The next pass classifies every report
    /// as Added and infers no deletions.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }

    pub fn fingerprint_of(&self, unique_id: &UniqueId) -> Option<&Fingerprint> {
        self.entries.get(unique_id)
    }

    pub fn contains(&self, unique_id: &UniqueId) -> bool {
        self.entries.contains_key(unique_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate stored entries (order unspecified).
    pub fn iter(&self) -> impl Iterator<Item = (&UniqueId, &Fingerprint)> {
        self.entries.iter()
    }
}
