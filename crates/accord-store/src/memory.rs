//! In-memory implementation of the Store trait.
//!
//! Useful for testing and for ephemeral groups that don't need durability.
//! Every composite operation runs under a single write lock, so it is
//! atomic with respect to concurrent readers, matching what the SQLite
//! backend guarantees with transactions. Nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use accord_core::{
    AnchorToken, ArchiveId, Category, Fingerprint, Mapping, MappingEntry, MappingId, MemberId,
    UniqueId,
};

use crate::error::Result;
use crate::traits::{ArchivedChange, CommitConfirmation, DeleteConfirmation, FinalizeRequest, Store};

/// In-memory store backed by hash maps.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    hashes: HashMap<(MemberId, Category), HashMap<UniqueId, Fingerprint>>,
    anchors: HashMap<(MemberId, Category), AnchorToken>,
    archive: BTreeMap<u64, ArchivedChange>,
    // Ids are handed out once and never reused, even after a drop.
    next_archive_id: u64,
    mappings: BTreeMap<(MappingId, MemberId), (Category, MappingEntry)>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner {
                next_archive_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn upsert_hash(
        &mut self,
        member: MemberId,
        category: &Category,
        unique_id: UniqueId,
        fingerprint: Fingerprint,
    ) {
        self.hashes
            .entry((member, category.clone()))
            .or_default()
            .insert(unique_id, fingerprint);
    }

    fn delete_hash(&mut self, member: MemberId, category: &Category, unique_id: &UniqueId) {
        if let Some(table) = self.hashes.get_mut(&(member, category.clone())) {
            table.remove(unique_id);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_hashes(
        &self,
        member: MemberId,
        category: &Category,
    ) -> Result<Vec<(UniqueId, Fingerprint)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .hashes
            .get(&(member, category.clone()))
            .map(|table| {
                table
                    .iter()
                    .map(|(uid, fp)| (uid.clone(), fp.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reset_hashes(&self, member: MemberId, category: &Category) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.hashes.remove(&(member, category.clone()));
        Ok(())
    }

    async fn anchor(&self, member: MemberId, category: &Category) -> Result<Option<AnchorToken>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.anchors.get(&(member, category.clone())).cloned())
    }

    async fn archive_store(&self, change: &ArchivedChange) -> Result<ArchiveId> {
        let mut inner = self.inner.write().unwrap();
        let id = inner.next_archive_id;
        inner.next_archive_id += 1;
        inner.archive.insert(id, change.clone());
        Ok(ArchiveId::new(id))
    }

    async fn archive_load(&self, id: ArchiveId) -> Result<Option<ArchivedChange>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.archive.get(&id.as_u64()).cloned())
    }

    async fn archive_drop(&self, id: ArchiveId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.archive.remove(&id.as_u64());
        Ok(())
    }

    async fn load_mappings(&self) -> Result<Vec<Mapping>> {
        let inner = self.inner.read().unwrap();
        let mut mappings: Vec<Mapping> = Vec::new();
        let mut current: Option<(MappingId, Category, Vec<MappingEntry>)> = None;
        for ((mapping_id, _), (category, entry)) in &inner.mappings {
            match current.as_mut() {
                Some((cur_id, _, entries)) if cur_id == mapping_id => {
                    entries.push(entry.clone())
                }
                _ => {
                    if let Some((cur_id, cat, entries)) = current.take() {
                        mappings.push(Mapping::from_entries(cur_id, cat, entries));
                    }
                    current = Some((*mapping_id, category.clone(), vec![entry.clone()]));
                }
            }
        }
        if let Some((cur_id, cat, entries)) = current.take() {
            mappings.push(Mapping::from_entries(cur_id, cat, entries));
        }
        Ok(mappings)
    }

    async fn save_entry(
        &self,
        mapping_id: MappingId,
        category: &Category,
        entry: &MappingEntry,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.mappings.insert(
            (mapping_id, entry.member),
            (category.clone(), entry.clone()),
        );
        Ok(())
    }

    async fn confirm_commit(&self, confirmation: &CommitConfirmation) -> Result<()> {
        let c = confirmation;
        let mut inner = self.inner.write().unwrap();
        inner.upsert_hash(
            c.member,
            &c.category,
            c.unique_id.clone(),
            c.fingerprint.clone(),
        );
        inner.mappings.insert(
            (c.mapping_id, c.member),
            (
                c.category.clone(),
                MappingEntry::clean(c.member, c.unique_id.clone()),
            ),
        );
        if let Some(archive_id) = c.drop_archive {
            inner.archive.remove(&archive_id.as_u64());
        }
        Ok(())
    }

    async fn confirm_delete(&self, deletion: &DeleteConfirmation) -> Result<()> {
        let d = deletion;
        let mut inner = self.inner.write().unwrap();
        inner.delete_hash(d.member, &d.category, &d.unique_id);
        inner.mappings.remove(&(d.mapping_id, d.member));
        if let Some(archive_id) = d.drop_archive {
            inner.archive.remove(&archive_id.as_u64());
        }
        Ok(())
    }

    async fn finalize_pass(&self, request: &FinalizeRequest) -> Result<()> {
        let r = request;
        let mut inner = self.inner.write().unwrap();
        for (unique_id, fingerprint) in &r.hash_upserts {
            inner.upsert_hash(r.member, &r.category, unique_id.clone(), fingerprint.clone());
        }
        for unique_id in &r.hash_deletes {
            inner.delete_hash(r.member, &r.category, unique_id);
        }
        for (mapping_id, entry) in &r.entry_upserts {
            inner.mappings.insert(
                (*mapping_id, r.member),
                (r.category.clone(), entry.clone()),
            );
        }
        for mapping_id in &r.entry_removals {
            inner.mappings.remove(&(*mapping_id, r.member));
        }
        inner
            .anchors
            .insert((r.member, r.category.clone()), r.anchor.clone());
        Ok(())
    }
}
