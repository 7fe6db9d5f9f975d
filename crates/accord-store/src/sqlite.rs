//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for Accord. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking. The three
//! composite operations (confirm_commit, confirm_delete, finalize_pass)
//! run inside explicit transactions; everything the coordinator treats as
//! one durable step is one SQLite transaction here.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use accord_core::{
    AnchorToken, ArchiveId, Category, ChangeKind, Fingerprint, Mapping, MappingEntry, MappingId,
    MemberId, UniqueId,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{ArchivedChange, CommitConfirmation, DeleteConfirmation, FinalizeRequest, Store};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking database call off the async runtime.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Encode an archive envelope as CBOR.
fn encode_change(change: &ArchivedChange) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(change, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Decode an archive envelope from CBOR.
fn decode_change(bytes: &[u8]) -> Result<ArchivedChange> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

// Helper to convert a mappings row to its parts.
fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(MappingId, Category, MappingEntry)> {
    let kind_raw: u16 = row.get("kind")?;
    let kind = ChangeKind::try_from(kind_raw).map_err(|_| {
        rusqlite::Error::InvalidColumnType(4, "kind".into(), rusqlite::types::Type::Integer)
    })?;
    let entry = MappingEntry {
        member: MemberId::new(row.get::<_, i64>("member")? as u32),
        unique_id: UniqueId::new(row.get::<_, String>("unique_id")?),
        kind,
        dirty: row.get::<_, i64>("dirty")? != 0,
        archive_id: row
            .get::<_, Option<i64>>("archive_id")?
            .map(|v| ArchiveId::new(v as u64)),
    };
    Ok((
        MappingId::new(row.get::<_, i64>("mapping_id")? as u64),
        Category::new(row.get::<_, String>("category")?),
        entry,
    ))
}

fn upsert_entry(
    conn: &Connection,
    mapping_id: MappingId,
    category: &Category,
    entry: &MappingEntry,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO mappings
            (mapping_id, member, category, unique_id, kind, dirty, archive_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            mapping_id.as_u64() as i64,
            entry.member.as_u32(),
            category.as_str(),
            entry.unique_id.as_str(),
            entry.kind.as_u16(),
            entry.dirty as i64,
            entry.archive_id.map(|a| a.as_u64() as i64),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_hashes(
        &self,
        member: MemberId,
        category: &Category,
    ) -> Result<Vec<(UniqueId, Fingerprint)>> {
        let category = category.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT unique_id, fingerprint FROM hashes
                 WHERE member = ?1 AND category = ?2",
            )?;
            let rows = stmt.query_map(params![member.as_u32(), category.as_str()], |row| {
                Ok((
                    UniqueId::new(row.get::<_, String>(0)?),
                    Fingerprint::new(row.get::<_, String>(1)?),
                ))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
        .await
    }

    async fn reset_hashes(&self, member: MemberId, category: &Category) -> Result<()> {
        let category = category.clone();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM hashes WHERE member = ?1 AND category = ?2",
                params![member.as_u32(), category.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn anchor(&self, member: MemberId, category: &Category) -> Result<Option<AnchorToken>> {
        let category = category.clone();
        self.call(move |conn| {
            let token: Option<String> = conn
                .query_row(
                    "SELECT token FROM anchors WHERE member = ?1 AND category = ?2",
                    params![member.as_u32(), category.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(token.map(AnchorToken::new))
        })
        .await
    }

    async fn archive_store(&self, change: &ArchivedChange) -> Result<ArchiveId> {
        let body = encode_change(change)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO archive (body, stored_at) VALUES (?1, ?2)",
                params![body, now_millis()],
            )?;
            Ok(ArchiveId::new(conn.last_insert_rowid() as u64))
        })
        .await
    }

    async fn archive_load(&self, id: ArchiveId) -> Result<Option<ArchivedChange>> {
        let body: Option<Vec<u8>> = self
            .call(move |conn| {
                let body = conn
                    .query_row(
                        "SELECT body FROM archive WHERE archive_id = ?1",
                        params![id.as_u64() as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(body)
            })
            .await?;
        body.map(|b| decode_change(&b)).transpose()
    }

    async fn archive_drop(&self, id: ArchiveId) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM archive WHERE archive_id = ?1",
                params![id.as_u64() as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_mappings(&self) -> Result<Vec<Mapping>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT mapping_id, member, category, unique_id, kind, dirty, archive_id
                 FROM mappings ORDER BY mapping_id, member",
            )?;
            let rows = stmt.query_map([], row_to_entry)?;

            let mut mappings: Vec<Mapping> = Vec::new();
            let mut current: Option<(MappingId, Category, Vec<MappingEntry>)> = None;
            for row in rows {
                let (id, category, entry) = row?;
                match current.as_mut() {
                    Some((cur_id, _, entries)) if *cur_id == id => entries.push(entry),
                    _ => {
                        if let Some((cur_id, cat, entries)) = current.take() {
                            mappings.push(Mapping::from_entries(cur_id, cat, entries));
                        }
                        current = Some((id, category, vec![entry]));
                    }
                }
            }
            if let Some((cur_id, cat, entries)) = current.take() {
                mappings.push(Mapping::from_entries(cur_id, cat, entries));
            }
            Ok(mappings)
        })
        .await
    }

    async fn save_entry(
        &self,
        mapping_id: MappingId,
        category: &Category,
        entry: &MappingEntry,
    ) -> Result<()> {
        let category = category.clone();
        let entry = entry.clone();
        self.call(move |conn| upsert_entry(conn, mapping_id, &category, &entry))
            .await
    }

    async fn confirm_commit(&self, confirmation: &CommitConfirmation) -> Result<()> {
        let c = confirmation.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO hashes (member, category, unique_id, fingerprint)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    c.member.as_u32(),
                    c.category.as_str(),
                    c.unique_id.as_str(),
                    c.fingerprint.as_str(),
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO mappings
                    (mapping_id, member, category, unique_id, kind, dirty, archive_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL)",
                params![
                    c.mapping_id.as_u64() as i64,
                    c.member.as_u32(),
                    c.category.as_str(),
                    c.unique_id.as_str(),
                    ChangeKind::Unmodified.as_u16(),
                ],
            )?;
            if let Some(archive_id) = c.drop_archive {
                tx.execute(
                    "DELETE FROM archive WHERE archive_id = ?1",
                    params![archive_id.as_u64() as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn confirm_delete(&self, deletion: &DeleteConfirmation) -> Result<()> {
        let d = deletion.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM hashes WHERE member = ?1 AND category = ?2 AND unique_id = ?3",
                params![d.member.as_u32(), d.category.as_str(), d.unique_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM mappings WHERE mapping_id = ?1 AND member = ?2",
                params![d.mapping_id.as_u64() as i64, d.member.as_u32()],
            )?;
            if let Some(archive_id) = d.drop_archive {
                tx.execute(
                    "DELETE FROM archive WHERE archive_id = ?1",
                    params![archive_id.as_u64() as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn finalize_pass(&self, request: &FinalizeRequest) -> Result<()> {
        let r = request.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for (unique_id, fingerprint) in &r.hash_upserts {
                tx.execute(
                    "INSERT OR REPLACE INTO hashes (member, category, unique_id, fingerprint)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        r.member.as_u32(),
                        r.category.as_str(),
                        unique_id.as_str(),
                        fingerprint.as_str(),
                    ],
                )?;
            }
            for unique_id in &r.hash_deletes {
                tx.execute(
                    "DELETE FROM hashes WHERE member = ?1 AND category = ?2 AND unique_id = ?3",
                    params![r.member.as_u32(), r.category.as_str(), unique_id.as_str()],
                )?;
            }
            for (mapping_id, entry) in &r.entry_upserts {
                upsert_entry(&tx, *mapping_id, &r.category, entry)?;
            }
            for mapping_id in &r.entry_removals {
                tx.execute(
                    "DELETE FROM mappings WHERE mapping_id = ?1 AND member = ?2",
                    params![mapping_id.as_u64() as i64, r.member.as_u32()],
                )?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO anchors (member, category, token, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    r.member.as_u32(),
                    r.category.as_str(),
                    r.anchor.as_str(),
                    now_millis(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use accord_core::FormatTag;
    use bytes::Bytes;

    fn member(id: u32) -> MemberId {
        MemberId::new(id)
    }

    fn contacts() -> Category {
        Category::new("contacts")
    }

    fn finalize(member_id: u32, token: &str) -> FinalizeRequest {
        FinalizeRequest {
            member: member(member_id),
            category: contacts(),
            anchor: AnchorToken::new(token),
            hash_upserts: Vec::new(),
            hash_deletes: Vec::new(),
            entry_upserts: Vec::new(),
            entry_removals: Vec::new(),
        }
    }

    fn envelope(uid: &str, payload: &[u8]) -> ArchivedChange {
        ArchivedChange {
            category: contacts(),
            unique_id: UniqueId::new(uid),
            format: FormatTag::new("text/x-vcard"),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[tokio::test]
    async fn test_finalize_writes_hashes_and_anchor_atomically() {
        let store = SqliteStore::open_memory().unwrap();
        let mut req = finalize(1, "T1");
        req.hash_upserts = vec![
            (UniqueId::new("a"), Fingerprint::new("fa")),
            (UniqueId::new("b"), Fingerprint::new("fb")),
        ];
        store.finalize_pass(&req).await.unwrap();

        let mut hashes = store.load_hashes(member(1), &contacts()).await.unwrap();
        hashes.sort();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0].1, Fingerprint::new("fa"));
        assert_eq!(
            store.anchor(member(1), &contacts()).await.unwrap(),
            Some(AnchorToken::new("T1"))
        );

        // A later pass deletes one id and advances the anchor in one step.
        let mut next = finalize(1, "T2");
        next.hash_deletes = vec![UniqueId::new("a")];
        store.finalize_pass(&next).await.unwrap();

        let hashes = store.load_hashes(member(1), &contacts()).await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(
            store.anchor(member(1), &contacts()).await.unwrap(),
            Some(AnchorToken::new("T2"))
        );
    }

    #[tokio::test]
    async fn test_requires_slow_sync_on_missing_or_mismatched_anchor() {
        let store = SqliteStore::open_memory().unwrap();
        let reported = AnchorToken::new("T2");
        // Nothing stored yet.
        assert!(store
            .requires_slow_sync(member(1), &contacts(), &reported)
            .await
            .unwrap());

        store.finalize_pass(&finalize(1, "T1")).await.unwrap();
        assert!(store
            .requires_slow_sync(member(1), &contacts(), &reported)
            .await
            .unwrap());

        store.finalize_pass(&finalize(1, "T2")).await.unwrap();
        assert!(!store
            .requires_slow_sync(member(1), &contacts(), &reported)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reset_hashes_clears_only_that_partition() {
        let store = SqliteStore::open_memory().unwrap();
        let mut req = finalize(1, "T1");
        req.hash_upserts = vec![(UniqueId::new("a"), Fingerprint::new("fa"))];
        store.finalize_pass(&req).await.unwrap();
        let mut other = finalize(2, "T1");
        other.hash_upserts = vec![(UniqueId::new("z"), Fingerprint::new("fz"))];
        store.finalize_pass(&other).await.unwrap();

        store.reset_hashes(member(1), &contacts()).await.unwrap();

        assert!(store
            .load_hashes(member(1), &contacts())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.load_hashes(member(2), &contacts()).await.unwrap().len(),
            1
        );
        // The anchor survives a reset; it only moves at finalize.
        assert!(store.anchor(member(1), &contacts()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_archive_ids_monotonic_and_never_reused() {
        let store = SqliteStore::open_memory().unwrap();
        let a = store.archive_store(&envelope("u1", b"one")).await.unwrap();
        let b = store.archive_store(&envelope("u2", b"two")).await.unwrap();
        assert!(b > a);

        store.archive_drop(b).await.unwrap();
        let c = store.archive_store(&envelope("u3", b"three")).await.unwrap();
        assert!(c > b);

        assert_eq!(store.archive_load(b).await.unwrap(), None);
        let loaded = store.archive_load(a).await.unwrap().unwrap();
        assert_eq!(loaded.payload, Bytes::from_static(b"one"));
        assert_eq!(loaded.unique_id, UniqueId::new("u1"));
    }

    #[tokio::test]
    async fn test_archive_drop_unknown_id_is_noop() {
        let store = SqliteStore::open_memory().unwrap();
        store.archive_drop(ArchiveId::new(999)).await.unwrap();
    }

    #[tokio::test]
    async fn test_confirm_commit_applies_all_effects() {
        let store = SqliteStore::open_memory().unwrap();
        let archive_id = store.archive_store(&envelope("u7", b"card")).await.unwrap();
        // In-flight marker as written before the commit attempt.
        let in_flight = MappingEntry::new(member(2), UniqueId::new("u7"), ChangeKind::Added)
            .with_archive(archive_id);
        store
            .save_entry(MappingId::new(1), &contacts(), &in_flight)
            .await
            .unwrap();

        store
            .confirm_commit(&CommitConfirmation {
                member: member(2),
                category: contacts(),
                mapping_id: MappingId::new(1),
                unique_id: UniqueId::new("u7"),
                fingerprint: Fingerprint::new("dest-fp"),
                drop_archive: Some(archive_id),
            })
            .await
            .unwrap();

        let hashes = store.load_hashes(member(2), &contacts()).await.unwrap();
        assert_eq!(hashes, vec![(UniqueId::new("u7"), Fingerprint::new("dest-fp"))]);

        let mappings = store.load_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        let entry = mappings[0].entry(member(2)).unwrap();
        assert_eq!(entry.kind, ChangeKind::Unmodified);
        assert!(!entry.dirty);
        assert!(entry.archive_id.is_none());

        assert_eq!(store.archive_load(archive_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_confirm_delete_removes_hash_and_entry() {
        let store = SqliteStore::open_memory().unwrap();
        let mut req = finalize(2, "T1");
        req.hash_upserts = vec![(UniqueId::new("u7"), Fingerprint::new("f"))];
        req.entry_upserts = vec![(
            MappingId::new(1),
            MappingEntry::clean(member(2), UniqueId::new("u7")),
        )];
        store.finalize_pass(&req).await.unwrap();
        store
            .save_entry(
                MappingId::new(1),
                &contacts(),
                &MappingEntry::clean(member(1), UniqueId::new("u7")),
            )
            .await
            .unwrap();

        store
            .confirm_delete(&DeleteConfirmation {
                member: member(2),
                category: contacts(),
                mapping_id: MappingId::new(1),
                unique_id: UniqueId::new("u7"),
                drop_archive: None,
            })
            .await
            .unwrap();

        assert!(store
            .load_hashes(member(2), &contacts())
            .await
            .unwrap()
            .is_empty());
        let mappings = store.load_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert!(mappings[0].entry(member(2)).is_none());
        assert!(mappings[0].entry(member(1)).is_some());
    }

    #[tokio::test]
    async fn test_load_mappings_groups_rows_by_id() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .save_entry(
                MappingId::new(1),
                &contacts(),
                &MappingEntry::clean(member(1), UniqueId::new("a")),
            )
            .await
            .unwrap();
        store
            .save_entry(
                MappingId::new(1),
                &contacts(),
                &MappingEntry::clean(member(2), UniqueId::new("a")),
            )
            .await
            .unwrap();
        store
            .save_entry(
                MappingId::new(5),
                &contacts(),
                &MappingEntry::new(member(1), UniqueId::new("b"), ChangeKind::Modified),
            )
            .await
            .unwrap();

        let mappings = store.load_mappings().await.unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].id(), MappingId::new(1));
        assert_eq!(mappings[0].len(), 2);
        assert_eq!(mappings[1].id(), MappingId::new(5));
        assert!(mappings[1].entry(member(1)).unwrap().dirty)
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accord.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let mut req = finalize(1, "T1");
            req.hash_upserts = vec![(UniqueId::new("a"), Fingerprint::new("fa"))];
            req.entry_upserts = vec![(
                MappingId::new(3),
                MappingEntry::clean(member(1), UniqueId::new("a")),
            )];
            store.finalize_pass(&req).await.unwrap();
            store.archive_store(&envelope("a", b"payload")).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.load_hashes(member(1), &contacts()).await.unwrap().len(),
            1
        );
        assert_eq!(
            store.anchor(member(1), &contacts()).await.unwrap(),
            Some(AnchorToken::new("T1"))
        );
        assert_eq!(store.load_mappings().await.unwrap().len(), 1);
        assert!(store
            .archive_load(ArchiveId::new(1))
            .await
            .unwrap()
            .is_some());
    }
}
