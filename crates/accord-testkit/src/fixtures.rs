//! Test fixtures for assembling synchronization scenarios.

use std::sync::Arc;

use bytes::Bytes;

use accord::{Group, GroupConfig};
use accord_core::{Category, MemberId, UniqueId};
use accord_engine::memory::InMemoryMember;
use accord_engine::SessionReport;
use accord_store::MemoryStore;

/// A ready-to-sync group over an in-memory store.
///
/// Members are [`InMemoryMember`]s; the fixture keeps a handle to each so
/// tests can seed items and inspect state after a pass.
pub struct GroupFixture {
    pub group: Group<MemoryStore>,
    pub members: Vec<Arc<InMemoryMember>>,
}

impl GroupFixture {
    /// Create an empty fixture with default session settings.
    pub fn new() -> Self {
        Self::with_config(GroupConfig::default())
    }

    pub fn with_config(config: GroupConfig) -> Self {
        Self {
            group: Group::new(MemoryStore::new(), config),
            members: Vec::new(),
        }
    }

    /// Add an in-memory member serving the given categories.
    ///
    /// Returns the id the group assigned; the handle lands at the matching
    /// position in [`members`](Self::members).
    pub fn add_member(
        &mut self,
        name: impl Into<String>,
        categories: impl IntoIterator<Item = Category>,
    ) -> MemberId {
        let member = Arc::new(InMemoryMember::new(name, categories));
        self.members.push(Arc::clone(&member));
        self.group.add_member(member)
    }

    /// Seed an item on one member, addressed by position.
    pub async fn seed(&self, member: usize, category: &str, unique_id: &str, payload: &[u8]) {
        self.members[member]
            .upsert_item(
                Category::new(category),
                UniqueId::new(unique_id),
                Bytes::copy_from_slice(payload),
            )
            .await;
    }

    /// Run one full pass.
    pub async fn sync(&self) -> accord::Result<SessionReport> {
        self.group.synchronize().await
    }
}

impl Default for GroupFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a fixture with `count` members all serving the same categories.
///
/// Members are named `member-1` through `member-<count>`.
pub fn mesh_fixture(count: usize, categories: &[Category]) -> GroupFixture {
    let mut fixture = GroupFixture::new();
    for n in 1..=count {
        fixture.add_member(format!("member-{n}"), categories.iter().cloned());
    }
    fixture
}
