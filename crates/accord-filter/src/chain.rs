//! The ordered filter chain.
//!
//! Rules are evaluated in registration order and the first matching
//! Allow or Deny decides. An empty chain, or one where nothing matches,
//! allows: filtering is opt-in restriction, not opt-in permission.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use accord_core::{Category, ChangeRecord, MemberId};

use crate::error::{FilterError, Result};
use crate::rule::{FilterAction, FilterRule, RuleId, Verdict};

/// A registered predicate: arbitrary per-propagation logic, given the
/// source member, destination member and the record under evaluation.
pub type Predicate = Arc<dyn Fn(MemberId, MemberId, &ChangeRecord) -> bool + Send + Sync>;

/// Ordered propagation policy for one group.
///
/// Removal leaves a hole rather than shifting later rules, so a `RuleId`
/// stays valid for the lifetime of the chain.
#[derive(Default)]
pub struct FilterChain {
    slots: Vec<Option<FilterRule>>,
    predicates: HashMap<String, Predicate>,
}

impl FilterChain {
    /// Create an empty chain. Everything is allowed until rules are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named predicate for rules to reference.
    ///
    /// Registering the same name again replaces the function; rules keep
    /// referring to the name, not the closure.
    pub fn register_predicate<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(MemberId, MemberId, &ChangeRecord) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    /// Append a rule to the chain.
    ///
    /// Fails if the rule can never match (source and dest pin the same
    /// member) or names a predicate that is not registered; either way
    /// the rule would silently decide nothing.
    pub fn add_rule(&mut self, rule: FilterRule) -> Result<RuleId> {
        if rule.is_self_loop() {
            return Err(FilterError::InvalidRule(
                "source and dest select the same member".to_string(),
            ));
        }
        if let Some(name) = rule.predicate_name() {
            if !self.predicates.contains_key(name) {
                return Err(FilterError::UnknownPredicate(name.to_string()));
            }
        }
        self.slots.push(Some(rule));
        Ok(RuleId::new(self.slots.len() - 1))
    }

    /// Remove a rule. Returns false if the id is unknown or already removed.
    pub fn remove_rule(&mut self, id: RuleId) -> bool {
        match self.slots.get_mut(id.as_usize()) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    /// Number of active rules.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &FilterRule> {
        self.slots.iter().flatten()
    }

    /// Decide whether a change may propagate from `source` to `dest`.
    ///
    /// First matching Allow or Deny wins. A matching Ignore rule decides
    /// nothing; it drops every later rule with the same selectors out of
    /// consideration. No match at all allows.
    pub fn evaluate(
        &self,
        source: MemberId,
        dest: MemberId,
        dest_cat: &Category,
        record: &ChangeRecord,
    ) -> Verdict {
        let mut ignored: Vec<&FilterRule> = Vec::new();
        for rule in self.slots.iter().flatten() {
            if !rule.matches(source, dest, dest_cat, record) {
                continue;
            }
            if ignored.iter().any(|earlier| earlier.same_selectors(rule)) {
                continue;
            }
            if let Some(name) = rule.predicate_name() {
                // Validated at add_rule; an unresolvable name cannot match.
                match self.predicates.get(name) {
                    Some(predicate) if predicate(source, dest, record) => {}
                    _ => continue,
                }
            }
            match rule.action() {
                FilterAction::Allow => return Verdict::Allow,
                FilterAction::Deny => return Verdict::Deny,
                FilterAction::Ignore => ignored.push(rule),
            }
        }
        Verdict::Allow
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("rules", &self.len())
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .finish()
    }
}
