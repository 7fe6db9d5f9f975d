//! The Group: unified API for the Accord engine.
//!
//! A group owns the durable store, the member set, and the filter chain,
//! and runs synchronization sessions over them.

use std::collections::BTreeMap;
use std::sync::Arc;

use accord_core::{Category, ChangeRecord, MemberId};
use accord_engine::{
    ConflictPolicy, Coordinator, Correlator, Member, ReportOnly, SessionConfig, SessionReport,
    UidCorrelator,
};
use accord_filter::{FilterChain, FilterRule, RuleId};
use accord_store::Store;

use crate::error::{GroupError, Result};

/// Configuration for the Group.
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    /// Session behavior: timeouts, retry bounds, payload fetching.
    pub session: SessionConfig,
}

/// The main Group struct.
///
/// Provides a unified API for:
/// - Managing the member set
/// - Configuring propagation filters
/// - Running synchronization sessions and previews
/// - Forcing resynchronization of a member's state
pub struct Group<S: Store> {
    /// The storage backend.
    store: Arc<S>,
    /// Members keyed by their engine-assigned ids.
    members: BTreeMap<MemberId, Arc<dyn Member>>,
    /// The next id handed out by [`Group::add_member`].
    next_member_id: u32,
    /// Propagation policy.
    chain: FilterChain,
    /// Matches unmapped reports to existing identities.
    correlator: Box<dyn Correlator>,
    /// Decides what happens when more than one member changed an entity.
    policy: Box<dyn ConflictPolicy>,
    /// Configuration.
    config: GroupConfig,
}

impl<S: Store + 'static> Group<S> {
    /// Create a new group over the given store.
    pub fn new(store: S, config: GroupConfig) -> Self {
        Self {
            store: Arc::new(store),
            members: BTreeMap::new(),
            next_member_id: 1,
            chain: FilterChain::new(),
            correlator: Box::new(UidCorrelator),
            policy: Box::new(ReportOnly),
            config,
        }
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Member Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a member and return its assigned id.
    ///
    /// Ids are assigned in order and never reused within a group, so
    /// filter rules keep meaning the member they were written for.
    pub fn add_member(&mut self, member: Arc<dyn Member>) -> MemberId {
        let id = MemberId::new(self.next_member_id);
        self.next_member_id += 1;
        self.members.insert(id, member);
        tracing::info!(member = %id, "member added");
        id
    }

    /// Remove a member from the group.
    ///
    /// Durable state attached to the member (fingerprints, mapping
    /// entries) is kept; re-adding a backend under a new id starts fresh.
    pub fn remove_member(&mut self, id: MemberId) -> Result<()> {
        match self.members.remove(&id) {
            Some(_) => {
                tracing::info!(member = %id, "member removed");
                Ok(())
            }
            None => Err(GroupError::UnknownMember(id)),
        }
    }

    /// Ids of all current members, in order.
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.members.keys().copied().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filter Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a rule to the filter chain. Earlier rules win.
    pub fn add_filter_rule(&mut self, rule: FilterRule) -> Result<RuleId> {
        Ok(self.chain.add_rule(rule)?)
    }

    /// Remove a rule. Other rule ids stay valid.
    pub fn remove_filter_rule(&mut self, id: RuleId) {
        self.chain.remove_rule(id);
    }

    /// Register a named predicate for rules to reference.
    pub fn register_predicate<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(MemberId, MemberId, &ChangeRecord) -> bool + Send + Sync + 'static,
    {
        self.chain.register_predicate(name, predicate);
    }

    /// Replace the correlator used for unmapped reports.
    pub fn set_correlator(&mut self, correlator: Box<dyn Correlator>) {
        self.correlator = correlator;
    }

    /// Replace the conflict policy.
    pub fn set_conflict_policy(&mut self, policy: Box<dyn ConflictPolicy>) {
        self.policy = policy;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Build a coordinator for one pass without starting it.
    ///
    /// Useful when the caller needs the abort handle; otherwise use
    /// [`Group::synchronize`] or [`Group::preview`].
    pub fn session(&self) -> Coordinator<'_, S> {
        Coordinator::new(
            Arc::clone(&self.store),
            &self.members,
            &self.chain,
            self.correlator.as_ref(),
            self.policy.as_ref(),
            self.config.session.clone(),
        )
    }

    /// Run one full synchronization pass.
    pub async fn synchronize(&self) -> Result<SessionReport> {
        Ok(self.session().run().await?)
    }

    /// Run a read-only pass reporting what [`Group::synchronize`] would do.
    pub async fn preview(&self) -> Result<SessionReport> {
        Ok(self.session().preview().await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Durably clear one member's fingerprint table for a category.
    ///
    /// The next pass treats every record the member reports as added and
    /// re-propagates it; identity grouping prevents duplicates at the
    /// destinations. Resyncing the established members is how a newly
    /// added member receives entities that predate it.
    pub async fn resync(&self, member: MemberId, category: &Category) -> Result<()> {
        if !self.members.contains_key(&member) {
            return Err(GroupError::UnknownMember(member));
        }
        tracing::info!(member = %member, %category, "fingerprint table reset requested");
        Ok(self.store.reset_hashes(member, category).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_engine::memory::InMemoryMember;
    use accord_store::MemoryStore;

    fn member(name: &str) -> Arc<dyn Member> {
        Arc::new(InMemoryMember::new(name, [Category::new("contacts")]))
    }

    #[test]
    fn test_member_ids_assigned_in_order_never_reused() {
        let mut group = Group::new(MemoryStore::new(), GroupConfig::default());
        let a = group.add_member(member("a"));
        let b = group.add_member(member("b"));
        assert_eq!(a, MemberId::new(1));
        assert_eq!(b, MemberId::new(2));

        group.remove_member(a).unwrap();
        let c = group.add_member(member("c"));
        assert_eq!(c, MemberId::new(3));
        assert_eq!(group.member_ids(), vec![b, c]);
    }

    #[test]
    fn test_removing_unknown_member_is_an_error() {
        let mut group = Group::new(MemoryStore::new(), GroupConfig::default());
        let result = group.remove_member(MemberId::new(9));
        assert!(matches!(result, Err(GroupError::UnknownMember(id)) if id == MemberId::new(9)));
    }

    #[test]
    fn test_rule_with_unknown_predicate_rejected() {
        let mut group = Group::new(MemoryStore::new(), GroupConfig::default());
        let result = group.add_filter_rule(FilterRule::deny().with_predicate("missing"));
        assert!(matches!(result, Err(GroupError::Filter(_))));
    }
}
