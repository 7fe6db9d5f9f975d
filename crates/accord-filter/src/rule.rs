//! Filter rules: who may propagate what to whom.
//!
//! A rule is a set of selectors plus an action. Selectors are `Option`s;
//! `None` is a wildcard that matches anything. Rules carry no behavior of
//! their own beyond selector matching; ordering and predicate resolution
//! live in the chain.

use serde::{Deserialize, Serialize};
use std::fmt;

use accord_core::{Category, ChangeRecord, MemberId};

/// What a matching rule does to the propagation being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterAction {
    /// Let the change propagate.
    Allow,
    /// Block the change.
    Deny,
    /// Neither; a matching Ignore rule suppresses later rules with the
    /// same selectors without deciding the outcome itself.
    Ignore,
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterAction::Allow => "allow",
            FilterAction::Deny => "deny",
            FilterAction::Ignore => "ignore",
        };
        f.write_str(s)
    }
}

/// The chain's decision for one (source, dest) propagation.
///
/// There is no "ignore" verdict; an unmatched evaluation allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        };
        f.write_str(s)
    }
}

/// Handle to a rule in a chain, returned by `add_rule`.
///
/// Ids are positional and never reused within one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub usize);

impl RuleId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One propagation rule.
///
/// Built with the action constructors and narrowed with the `with_*`
/// setters; a fresh rule matches every propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    source_member: Option<MemberId>,
    dest_member: Option<MemberId>,
    source_category: Option<Category>,
    dest_category: Option<Category>,
    detect_category: Option<Category>,
    action: FilterAction,
    /// Name of a registered predicate, resolved by the chain at match time.
    predicate: Option<String>,
}

impl FilterRule {
    fn with_action(action: FilterAction) -> Self {
        Self {
            source_member: None,
            dest_member: None,
            source_category: None,
            dest_category: None,
            detect_category: None,
            action,
            predicate: None,
        }
    }

    /// A rule that allows everything it matches.
    pub fn allow() -> Self {
        Self::with_action(FilterAction::Allow)
    }

    /// A rule that denies everything it matches.
    pub fn deny() -> Self {
        Self::with_action(FilterAction::Deny)
    }

    /// A rule that decides nothing but suppresses later rules with the
    /// same selectors.
    pub fn ignore() -> Self {
        Self::with_action(FilterAction::Ignore)
    }

    /// Match only changes originating at this member.
    pub fn from_member(mut self, member: MemberId) -> Self {
        self.source_member = Some(member);
        self
    }

    /// Match only changes destined for this member.
    pub fn to_member(mut self, member: MemberId) -> Self {
        self.dest_member = Some(member);
        self
    }

    /// Match only changes reported under this category.
    pub fn source_category(mut self, category: Category) -> Self {
        self.source_category = Some(category);
        self
    }

    /// Match only changes being committed under this category.
    pub fn dest_category(mut self, category: Category) -> Self {
        self.dest_category = Some(category);
        self
    }

    /// Match only changes whose payload was detected as this category.
    pub fn detect_category(mut self, category: Category) -> Self {
        self.detect_category = Some(category);
        self
    }

    /// Gate this rule on a named predicate. The name must be registered
    /// with the chain before the rule is added.
    pub fn with_predicate(mut self, name: impl Into<String>) -> Self {
        self.predicate = Some(name.into());
        self
    }

    pub fn action(&self) -> FilterAction {
        self.action
    }

    pub fn predicate_name(&self) -> Option<&str> {
        self.predicate.as_deref()
    }

    /// True when source and dest pin the same member. Changes never
    /// propagate from a member to itself, so such a rule cannot match.
    pub fn is_self_loop(&self) -> bool {
        self.source_member.is_some() && self.source_member == self.dest_member
    }

    /// Check the member and category selectors against one propagation.
    ///
    /// `dest_cat` is the category the destination will store under; the
    /// source and detect selectors compare against the record's own
    /// category. Predicates are not consulted here.
    pub fn matches(
        &self,
        source: MemberId,
        dest: MemberId,
        dest_cat: &Category,
        record: &ChangeRecord,
    ) -> bool {
        fn selected<T: PartialEq>(selector: &Option<T>, value: &T) -> bool {
            match selector {
                Some(wanted) => wanted == value,
                None => true,
            }
        }

        selected(&self.source_member, &source)
            && selected(&self.dest_member, &dest)
            && selected(&self.source_category, &record.category)
            && selected(&self.dest_category, dest_cat)
            && selected(&self.detect_category, &record.category)
    }

    /// Whether two rules select the same propagations, predicate aside.
    /// This is the identity Ignore suppression works on.
    pub fn same_selectors(&self, other: &FilterRule) -> bool {
        self.source_member == other.source_member
            && self.dest_member == other.dest_member
            && self.source_category == other.source_category
            && self.dest_category == other.dest_category
            && self.detect_category == other.detect_category
    }
}
