//! Member abstraction: the engine side of one synchronizable endpoint.
//!
//! A member is a device or application that holds records and answers a
//! small command set. The coordinator talks to every member through this
//! trait; per-member command order is strict (connect before anything,
//! sync_done only after all commits settle), concurrency exists only
//! across members.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use accord_core::{AnchorToken, Category, ChangeKind, ChangeRecord, Fingerprint, FormatTag, UniqueId};

/// Per-member failures.
///
/// These are isolated: they remove the member from the current session
/// and land in the report, but never abort the session for others.
#[derive(Debug, Error)]
pub enum MemberError {
    /// Connecting failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Fetching changes failed mid-stream.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A commit command failed.
    #[error("commit failed: {0}")]
    Commit(String),

    /// The completion signal was refused.
    #[error("sync completion failed: {0}")]
    Finish(String),

    /// The member did not answer within the session's member timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Disconnecting failed.
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// Result type for member operations.
pub type MemberResult<T> = std::result::Result<T, MemberError>;

/// What a member reports when it connects.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    /// The member's current anchor token per served category. The keys
    /// define which categories this member takes part in.
    pub anchors: BTreeMap<Category, AnchorToken>,
}

/// One propagation command: apply this change to your store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub category: Category,
    pub unique_id: UniqueId,
    pub kind: ChangeKind,
    /// Absent for deletions.
    pub payload: Option<Bytes>,
    pub format: FormatTag,
}

/// The capability contract every member implements.
///
/// Implementations must be thread-safe (Send + Sync); the coordinator
/// drives different members from different tasks.
#[async_trait]
pub trait Member: Send + Sync {
    /// Open a session with the member.
    ///
    /// The returned info carries the member's anchor tokens; a token that
    /// differs from the engine's stored one forces a slow sync for that
    /// category.
    async fn connect(&self) -> MemberResult<MemberInfo>;

    /// Ask for all changes the member wants to report this pass.
    ///
    /// The stream ends by channel exhaustion. With `with_data = false`
    /// payloads are omitted (metadata-only, used by preview sessions).
    async fn get_changes(&self, with_data: bool) -> MemberResult<mpsc::Receiver<ChangeRecord>>;

    /// Apply one change. Returns the member's own fingerprint for the
    /// stored result; the engine records that, not the source's. The
    /// return value is meaningless for deletions.
    async fn commit_change(&self, request: CommitRequest) -> MemberResult<Fingerprint>;

    /// Signal that the pass is complete and durable on the engine side.
    async fn sync_done(&self) -> MemberResult<()>;

    /// Close the session.
    async fn disconnect(&self) -> MemberResult<()>;
}

/// A complete in-process member for tests and local mirrors.
pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::RwLock;

    const DEFAULT_FORMAT: &str = "application/octet-stream";

    /// One stored record.
    #[derive(Debug, Clone)]
    struct Item {
        payload: Bytes,
        format: FormatTag,
    }

    #[derive(Debug, Default)]
    struct Inner {
        items: BTreeMap<(Category, UniqueId), Item>,
        anchors: BTreeMap<Category, AnchorToken>,
        /// Explicit tombstones queued for the next fetch.
        deletion_reports: Vec<ChangeRecord>,
        connected: bool,
        connect_failures: u32,
        commit_failures: u32,
        commits: Vec<CommitRequest>,
        sync_done_count: u32,
    }

    /// In-memory member backed by a plain item table.
    ///
    /// Anchor tokens are random but stable; they change only through
    /// [`reset_identity`], which is how tests force a slow sync.
    ///
    /// [`reset_identity`]: InMemoryMember::reset_identity
    pub struct InMemoryMember {
        name: String,
        inner: RwLock<Inner>,
    }

    fn fresh_token() -> AnchorToken {
        AnchorToken::new(format!("{:016x}", rand::random::<u64>()))
    }

    impl InMemoryMember {
        /// Create a member serving the given categories.
        pub fn new(name: impl Into<String>, categories: impl IntoIterator<Item = Category>) -> Self {
            let anchors = categories
                .into_iter()
                .map(|category| (category, fresh_token()))
                .collect();
            Self {
                name: name.into(),
                inner: RwLock::new(Inner {
                    anchors,
                    ..Default::default()
                }),
            }
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Insert or overwrite a record, as if the user edited it on the
        /// device between sessions.
        pub async fn upsert_item(
            &self,
            category: Category,
            unique_id: UniqueId,
            payload: impl Into<Bytes>,
        ) {
            let mut inner = self.inner.write().await;
            inner.items.insert(
                (category, unique_id),
                Item {
                    payload: payload.into(),
                    format: FormatTag::new(DEFAULT_FORMAT),
                },
            );
        }

        /// Remove a record silently. The engine notices the absence on the
        /// next pass (implicit deletion).
        pub async fn remove_item(&self, category: &Category, unique_id: &UniqueId) {
            let mut inner = self.inner.write().await;
            inner
                .items
                .remove(&(category.clone(), unique_id.clone()));
        }

        /// Remove a record and queue an explicit deletion report for the
        /// next fetch.
        pub async fn remove_item_reported(&self, category: &Category, unique_id: &UniqueId) {
            let mut inner = self.inner.write().await;
            if inner
                .items
                .remove(&(category.clone(), unique_id.clone()))
                .is_some()
            {
                inner.deletion_reports.push(ChangeRecord::deletion(
                    category.clone(),
                    unique_id.clone(),
                    FormatTag::new(DEFAULT_FORMAT),
                ));
            }
        }

        /// Regenerate all anchor tokens, as if the member was restored
        /// from a backup. Forces a slow sync on every category.
        pub async fn reset_identity(&self) {
            let mut inner = self.inner.write().await;
            for token in inner.anchors.values_mut() {
                *token = fresh_token();
            }
        }

        /// Make the next `n` connect calls fail.
        pub async fn fail_connects(&self, n: u32) {
            self.inner.write().await.connect_failures = n;
        }

        /// Make the next `n` commit calls fail.
        pub async fn fail_commits(&self, n: u32) {
            self.inner.write().await.commit_failures = n;
        }

        pub async fn get_item(&self, category: &Category, unique_id: &UniqueId) -> Option<Bytes> {
            let inner = self.inner.read().await;
            inner
                .items
                .get(&(category.clone(), unique_id.clone()))
                .map(|item| item.payload.clone())
        }

        pub async fn item_count(&self, category: &Category) -> usize {
            let inner = self.inner.read().await;
            inner.items.keys().filter(|(c, _)| c == category).count()
        }

        /// Every commit request this member has accepted, in order.
        pub async fn committed(&self) -> Vec<CommitRequest> {
            self.inner.read().await.commits.clone()
        }

        pub async fn sync_done_count(&self) -> u32 {
            self.inner.read().await.sync_done_count
        }
    }

    #[async_trait]
    impl Member for InMemoryMember {
        async fn connect(&self) -> MemberResult<MemberInfo> {
            let mut inner = self.inner.write().await;
            if inner.connect_failures > 0 {
                inner.connect_failures -= 1;
                return Err(MemberError::Connect(format!("{}: injected failure", self.name)));
            }
            inner.connected = true;
            Ok(MemberInfo {
                anchors: inner.anchors.clone(),
            })
        }

        async fn get_changes(&self, with_data: bool) -> MemberResult<mpsc::Receiver<ChangeRecord>> {
            let mut inner = self.inner.write().await;
            if !inner.connected {
                return Err(MemberError::Fetch(format!("{}: not connected", self.name)));
            }

            // This member cannot track edits, so it reports its whole
            // table each pass and lets the engine classify.
            let mut records: Vec<ChangeRecord> = inner
                .items
                .iter()
                .map(|((category, unique_id), item)| {
                    let fingerprint = Fingerprint::of_payload(&item.payload);
                    if with_data {
                        ChangeRecord::with_payload(
                            category.clone(),
                            unique_id.clone(),
                            fingerprint,
                            item.payload.clone(),
                            item.format.clone(),
                            ChangeKind::Added,
                        )
                    } else {
                        ChangeRecord::metadata_only(
                            category.clone(),
                            unique_id.clone(),
                            fingerprint,
                            item.format.clone(),
                            ChangeKind::Added,
                        )
                    }
                })
                .collect();
            records.append(&mut inner.deletion_reports);

            let (tx, rx) = mpsc::channel(records.len().max(1));
            for record in records {
                // Capacity covers every record; the send cannot block.
                let _ = tx.try_send(record);
            }
            Ok(rx)
        }

        async fn commit_change(&self, request: CommitRequest) -> MemberResult<Fingerprint> {
            let mut inner = self.inner.write().await;
            if !inner.connected {
                return Err(MemberError::Commit(format!("{}: not connected", self.name)));
            }
            if inner.commit_failures > 0 {
                inner.commit_failures -= 1;
                return Err(MemberError::Commit(format!("{}: injected failure", self.name)));
            }

            let key = (request.category.clone(), request.unique_id.clone());
            let fingerprint = match request.kind {
                ChangeKind::Deleted => {
                    inner.items.remove(&key);
                    Fingerprint::new("")
                }
                _ => {
                    let payload = request.payload.clone().ok_or_else(|| {
                        MemberError::Commit(format!("{}: missing payload", self.name))
                    })?;
                    let fingerprint = Fingerprint::of_payload(&payload);
                    inner.items.insert(
                        key,
                        Item {
                            payload,
                            format: request.format.clone(),
                        },
                    );
                    fingerprint
                }
            };
            inner.commits.push(request);
            Ok(fingerprint)
        }

        async fn sync_done(&self) -> MemberResult<()> {
            let mut inner = self.inner.write().await;
            inner.sync_done_count += 1;
            Ok(())
        }

        async fn disconnect(&self) -> MemberResult<()> {
            let mut inner = self.inner.write().await;
            inner.connected = false;
            Ok(())
        }
    }
}
