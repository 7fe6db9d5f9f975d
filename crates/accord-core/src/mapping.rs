//! Cross-member identity: grouping per-member records into mappings.
//!
//! A [`Mapping`] is the engine's statement that "these records, one per
//! member, are the same real-world entity". The [`MappingTable`] owns every
//! mapping and maintains a (member, category, unique id) index so that the
//! identity-uniqueness invariant can be enforced on every mutation: a pair
//! belongs to at most one mapping at a time.
//!
//! The table is loaded from persisted storage at session start and written
//! back through the store layer at the transactional boundaries; within a
//! session all grouping decisions happen here.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::change::ChangeKind;
use crate::error::{CoreError, Result};
use crate::types::{ArchiveId, Category, MappingId, MemberId, UniqueId};

/// One member's side of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub member: MemberId,
    pub unique_id: UniqueId,
    pub kind: ChangeKind,
    /// Set while this side carries an unpropagated change.
    pub dirty: bool,
    /// Set only while a propagation to this member is in flight; names the
    /// archived payload to replay from after a crash or commit failure.
    pub archive_id: Option<ArchiveId>,
}

impl MappingEntry {
    /// An entry as classified from a member report.
    pub fn new(member: MemberId, unique_id: UniqueId, kind: ChangeKind) -> Self {
        Self {
            member,
            unique_id,
            kind,
            dirty: kind.is_dirty(),
            archive_id: None,
        }
    }

    /// A settled entry (nothing to propagate).
    pub fn clean(member: MemberId, unique_id: UniqueId) -> Self {
        Self {
            member,
            unique_id,
            kind: ChangeKind::Unmodified,
            dirty: false,
            archive_id: None,
        }
    }

    /// Mark this entry as an in-flight propagation target.
    pub fn with_archive(mut self, archive_id: ArchiveId) -> Self {
        self.archive_id = Some(archive_id);
        self
    }

    /// Whether this entry is an interrupted propagation to be replayed.
    pub fn is_in_flight(&self) -> bool {
        self.dirty && self.archive_id.is_some()
    }
}

/// One cross-member identity grouping: at most one entry per member.
#[derive(Debug, Clone)]
pub struct Mapping {
    id: MappingId,
    category: Category,
    entries: BTreeMap<MemberId, MappingEntry>,
}

impl Mapping {
    fn new(id: MappingId, category: Category) -> Self {
        Self {
            id,
            category,
            entries: BTreeMap::new(),
        }
    }

    /// Reconstruct a mapping from persisted entries. Later duplicates for
    /// the same member replace earlier ones.
    pub fn from_entries(
        id: MappingId,
        category: Category,
        entries: impl IntoIterator<Item = MappingEntry>,
    ) -> Self {
        let mut mapping = Self::new(id, category);
        for entry in entries {
            mapping.entries.insert(entry.member, entry);
        }
        mapping
    }

    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    /// Entries in member order.
    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    pub fn entry(&self, member: MemberId) -> Option<&MappingEntry> {
        self.entries.get(&member)
    }

    pub fn members(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dirty_entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values().filter(|e| e.dirty)
    }

    pub fn has_dirty_entries(&self) -> bool {
        self.dirty_entries().next().is_some()
    }

    /// More than one side changed in the same interval. The engine reports
    /// this and leaves resolution to external policy.
    pub fn is_conflicted(&self) -> bool {
        self.dirty_entries().count() > 1
    }
}

type IndexKey = (MemberId, Category, UniqueId);

/// Owner of every mapping, with the identity-uniqueness index.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    mappings: BTreeMap<MappingId, Mapping>,
    index: HashMap<IndexKey, MappingId>,
    next_id: u64,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table from persisted mappings.
    ///
    /// Fails with an identity conflict if two mappings claim the same
    /// (member, category, unique id) pair, which indicates a corrupt store.
    pub fn from_mappings(mappings: impl IntoIterator<Item = Mapping>) -> Result<Self> {
        let mut table = Self::new();
        for mapping in mappings {
            let id = mapping.id;
            for entry in mapping.entries.values() {
                let key = (entry.member, mapping.category.clone(), entry.unique_id.clone());
                if let Some(&other) = table.index.get(&key) {
                    return Err(CoreError::IdentityConflict {
                        member: entry.member,
                        unique_id: entry.unique_id.clone(),
                        existing: other,
                        requested: id,
                    });
                }
                table.index.insert(key, id);
            }
            table.next_id = table.next_id.max(id.as_u64() + 1);
            table.mappings.insert(id, mapping);
        }
        Ok(table)
    }

    /// Group one classified record.
    ///
    /// Resolution order:
    /// 1. The (member, category, unique id) pair already belongs to a
    ///    mapping: update that entry there. A hint naming a *different*
    ///    live mapping is an identity conflict; the stale entry must be
    ///    removed first.
    /// 2. A live hint of the same category adopts the entry (this is how a
    ///    correlator links a fresh record to its counterparts).
    /// 3. Otherwise a new mapping is created with this single entry.
    ///
    /// Dangling and cross-category hints are treated as no hint.
    pub fn find_or_create(
        &mut self,
        category: &Category,
        entry: MappingEntry,
        hint: Option<MappingId>,
    ) -> Result<MappingId> {
        let key = (entry.member, category.clone(), entry.unique_id.clone());

        if let Some(&existing) = self.index.get(&key) {
            if let Some(requested) = hint {
                if requested != existing && self.mappings.contains_key(&requested) {
                    return Err(CoreError::IdentityConflict {
                        member: entry.member,
                        unique_id: entry.unique_id,
                        existing,
                        requested,
                    });
                }
            }
            self.attach(existing, entry);
            return Ok(existing);
        }

        if let Some(requested) = hint {
            let adoptable = self
                .mappings
                .get(&requested)
                .is_some_and(|m| m.category == *category);
            if adoptable {
                self.attach(requested, entry);
                return Ok(requested);
            }
        }

        let id = MappingId::new(self.next_id);
        self.next_id += 1;
        let mut mapping = Mapping::new(id, category.clone());
        self.index.insert(key, id);
        mapping.entries.insert(entry.member, entry);
        self.mappings.insert(id, mapping);
        Ok(id)
    }

    /// Insert or replace one member's entry in an existing mapping.
    ///
    /// Used by the coordinator to mirror commit confirmations (dirty flags
    /// cleared, archive references set and dropped, destination entries
    /// attached after a successful propagation).
    pub fn record(&mut self, mapping_id: MappingId, entry: MappingEntry) -> Result<()> {
        let category = match self.mappings.get(&mapping_id) {
            Some(m) => m.category.clone(),
            None => return Err(CoreError::UnknownMapping(mapping_id)),
        };
        let key = (entry.member, category, entry.unique_id.clone());
        if let Some(&other) = self.index.get(&key) {
            if other != mapping_id {
                return Err(CoreError::IdentityConflict {
                    member: entry.member,
                    unique_id: entry.unique_id,
                    existing: other,
                    requested: mapping_id,
                });
            }
        }
        self.attach(mapping_id, entry);
        Ok(())
    }

    /// Remove one member's entry. An emptied mapping is deleted; its id is
    /// never reused.
    pub fn remove_entry(&mut self, mapping_id: MappingId, member: MemberId) -> Option<MappingEntry> {
        let mapping = self.mappings.get_mut(&mapping_id)?;
        let removed = mapping.entries.remove(&member)?;
        self.index
            .remove(&(member, mapping.category.clone(), removed.unique_id.clone()));
        if mapping.entries.is_empty() {
            self.mappings.remove(&mapping_id);
        }
        Some(removed)
    }

    pub fn get(&self, id: MappingId) -> Option<&Mapping> {
        self.mappings.get(&id)
    }

    /// Which mapping a pair belongs to, if any.
    pub fn mapping_for(
        &self,
        member: MemberId,
        category: &Category,
        unique_id: &UniqueId,
    ) -> Option<MappingId> {
        self.index
            .get(&(member, category.clone(), unique_id.clone()))
            .copied()
    }

    /// All mappings in id order. Finite and restartable.
    pub fn all_mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn attach(&mut self, id: MappingId, entry: MappingEntry) {
        if let Some(mapping) = self.mappings.get_mut(&id) {
            // A member may reassign its unique id; drop the stale index key.
            if let Some(prev) = mapping.entries.get(&entry.member) {
                if prev.unique_id != entry.unique_id {
                    self.index.remove(&(
                        entry.member,
                        mapping.category.clone(),
                        prev.unique_id.clone(),
                    ));
                }
            }
            self.index.insert(
                (entry.member, mapping.category.clone(), entry.unique_id.clone()),
                id,
            );
            mapping.entries.insert(entry.member, entry);
        }
    }
}
