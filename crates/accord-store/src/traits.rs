//! Store trait: the abstract interface for durable sync state.
//!
//! One store holds every persisted structure of a group: the per-member
//! fingerprint tables, the per-member anchors, the payload archive, and the
//! mapping table. Implementations include SQLite (primary) and in-memory
//! (for tests and ephemeral groups).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use accord_core::{
    AnchorToken, ArchiveId, Category, Fingerprint, FormatTag, Mapping, MappingEntry, MappingId,
    MemberId, UniqueId,
};

use crate::error::Result;

/// The payload envelope persisted in the archive.
///
/// Carries enough context to replay the commit to its destination without
/// re-contacting the source member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedChange {
    pub category: Category,
    pub unique_id: UniqueId,
    pub format: FormatTag,
    pub payload: Bytes,
}

/// Durable effects of one successful commit to a destination member.
///
/// Applied in a single transaction: the destination's hash entry is written
/// with the fingerprint the member itself returned, the mapping entry is
/// rewritten clean, and the in-flight archive row is dropped.
#[derive(Debug, Clone)]
pub struct CommitConfirmation {
    pub member: MemberId,
    pub category: Category,
    pub mapping_id: MappingId,
    pub unique_id: UniqueId,
    pub fingerprint: Fingerprint,
    pub drop_archive: Option<ArchiveId>,
}

/// Durable effects of one confirmed deletion at a destination member.
///
/// Applied in a single transaction: hash entry and mapping entry are
/// removed; a stale in-flight archive row, if any, is dropped.
#[derive(Debug, Clone)]
pub struct DeleteConfirmation {
    pub member: MemberId,
    pub category: Category,
    pub mapping_id: MappingId,
    pub unique_id: UniqueId,
    pub drop_archive: Option<ArchiveId>,
}

/// End-of-pass durable effects for one (member, category).
///
/// Everything lands in a single transaction: the member's own hash upserts
/// and deletes, its rewritten mapping entries, the removals of deleted
/// entries, and the anchor advance. A crash leaves either the previous pass
/// or this one, never a mixture.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub member: MemberId,
    pub category: Category,
    pub anchor: AnchorToken,
    pub hash_upserts: Vec<(UniqueId, Fingerprint)>,
    pub hash_deletes: Vec<UniqueId>,
    pub entry_upserts: Vec<(MappingId, MappingEntry)>,
    /// Mappings losing this member's entry (deleted records).
    pub entry_removals: Vec<MappingId>,
}

/// The Store trait: async interface for sync-state persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, `spawn_blocking` is used internally to avoid blocking the
/// runtime.
///
/// # Design Notes
///
/// - **Partitioning**: hashes and anchors are keyed by (member, category)
///   and may be updated concurrently across members.
/// - **Transactional boundaries**: `confirm_commit`, `confirm_delete`, and
///   `finalize_pass` are all-or-nothing; these are the only operations that
///   mutate hashes, anchors, or settled mapping entries.
/// - **Append-only archive**: archive ids grow monotonically and are never
///   reused, even after `archive_drop`.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Hash Tables
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the persisted fingerprint entries for one (member, category).
    async fn load_hashes(
        &self,
        member: MemberId,
        category: &Category,
    ) -> Result<Vec<(UniqueId, Fingerprint)>>;

    /// Durably clear one (member, category) fingerprint table (slow-sync).
    async fn reset_hashes(&self, member: MemberId, category: &Category) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Anchors
    // ─────────────────────────────────────────────────────────────────────────

    /// The stored anchor token, if any. Writing happens only through
    /// [`Store::finalize_pass`].
    async fn anchor(&self, member: MemberId, category: &Category) -> Result<Option<AnchorToken>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Archive
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a payload envelope. The returned id is monotonically
    /// increasing and the row is durable before this returns.
    async fn archive_store(&self, change: &ArchivedChange) -> Result<ArchiveId>;

    /// Load an archived envelope.
    async fn archive_load(&self, id: ArchiveId) -> Result<Option<ArchivedChange>>;

    /// Drop an archived envelope. Dropping an unknown id is a no-op.
    async fn archive_drop(&self, id: ArchiveId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Mappings
    // ─────────────────────────────────────────────────────────────────────────

    /// Load every persisted mapping, grouped and ordered by mapping id.
    async fn load_mappings(&self) -> Result<Vec<Mapping>>;

    /// Insert or replace one mapping entry. Used to write the in-flight
    /// marker (dirty + archive id) before a commit is attempted.
    async fn save_entry(
        &self,
        mapping_id: MappingId,
        category: &Category,
        entry: &MappingEntry,
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Transactional Boundaries
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one commit confirmation atomically.
    async fn confirm_commit(&self, confirmation: &CommitConfirmation) -> Result<()>;

    /// Apply one deletion confirmation atomically.
    async fn confirm_delete(&self, deletion: &DeleteConfirmation) -> Result<()>;

    /// Apply one member's end-of-pass state atomically.
    async fn finalize_pass(&self, request: &FinalizeRequest) -> Result<()>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Whether a member's reported token forces a slow-sync for a category:
    /// true if no token is stored or the stored one differs.
    fn requires_slow_sync(
        &self,
        member: MemberId,
        category: &Category,
        reported: &AnchorToken,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn requires_slow_sync(
        &self,
        member: MemberId,
        category: &Category,
        reported: &AnchorToken,
    ) -> Result<bool> {
        Ok(match self.anchor(member, category).await? {
            Some(stored) => stored != *reported,
            None => true,
        })
    }
}
