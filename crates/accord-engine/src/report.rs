//! Session reports: what one synchronization pass did and did not do.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use accord_core::{Category, MappingId, MemberId, UniqueId};

use crate::conflict::Conflict;

/// The coordinator stage a member failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStage {
    Connecting,
    FetchingChanges,
    Reconciling,
    Committing,
    Finishing,
    Disconnecting,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStage::Connecting => "connecting",
            SessionStage::FetchingChanges => "fetching-changes",
            SessionStage::Reconciling => "reconciling",
            SessionStage::Committing => "committing",
            SessionStage::Finishing => "finishing",
            SessionStage::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// How one member's session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberOutcome {
    /// The member went through every stage.
    Completed,
    /// The member dropped out; later stages did not run for it.
    Failed { stage: SessionStage, reason: String },
}

impl MemberOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, MemberOutcome::Completed)
    }
}

/// A propagation pair that exhausted its commit attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCommit {
    pub mapping_id: MappingId,
    pub category: Category,
    pub unique_id: UniqueId,
    pub attempts: u32,
    pub reason: String,
}

/// Per-member accounting for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberReport {
    pub outcome: MemberOutcome,
    /// Records the member reported during the fetch stage.
    pub fetched: usize,
    /// Changes applied *to* this member.
    pub applied_adds: usize,
    pub applied_updates: usize,
    pub applied_deletes: usize,
    /// Pairs destined for this member that failed permanently.
    pub failed_commits: Vec<FailedCommit>,
}

impl MemberReport {
    pub(crate) fn new() -> Self {
        Self {
            outcome: MemberOutcome::Completed,
            fetched: 0,
            applied_adds: 0,
            applied_updates: 0,
            applied_deletes: 0,
            failed_commits: Vec::new(),
        }
    }

    pub(crate) fn failed(stage: SessionStage, reason: impl Into<String>) -> Self {
        Self {
            outcome: MemberOutcome::Failed {
                stage,
                reason: reason.into(),
            },
            ..Self::new()
        }
    }

    pub fn applied_total(&self) -> usize {
        self.applied_adds + self.applied_updates + self.applied_deletes
    }
}

/// The full record of one synchronization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: u64,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    /// True when the session fetched metadata only and stopped before
    /// committing anything.
    pub preview: bool,
    pub members: BTreeMap<MemberId, MemberReport>,
    /// Categories that went through a full reclassification because the
    /// member's anchor token did not match the stored one.
    pub slow_synced: Vec<(MemberId, Category)>,
    /// In-flight propagations recovered from the archive at session start.
    pub replayed: usize,
    /// Pairs the reconciliation planned to commit.
    pub planned: usize,
    pub conflicts: Vec<Conflict>,
}

impl SessionReport {
    /// A clean session: every member completed, nothing failed, nothing
    /// conflicted.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
            && self
                .members
                .values()
                .all(|m| m.outcome.is_completed() && m.failed_commits.is_empty())
    }

    pub fn total_fetched(&self) -> usize {
        self.members.values().map(|m| m.fetched).sum()
    }

    pub fn total_applied(&self) -> usize {
        self.members.values().map(|m| m.applied_total()).sum()
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed_members = self
            .members
            .values()
            .filter(|m| !m.outcome.is_completed())
            .count();
        write!(
            f,
            "session {:016x}: {} members ({} failed), fetched {}, planned {}, applied {}, \
             replayed {}, {} conflicts{}",
            self.session_id,
            self.members.len(),
            failed_members,
            self.total_fetched(),
            self.planned,
            self.total_applied(),
            self.replayed,
            self.conflicts.len(),
            if self.preview { " [preview]" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_report() -> SessionReport {
        SessionReport {
            session_id: 0xabcd,
            started_at_ms: 1_000,
            finished_at_ms: 2_000,
            preview: false,
            members: BTreeMap::new(),
            slow_synced: Vec::new(),
            replayed: 0,
            planned: 0,
            conflicts: Vec::new(),
        }
    }

    #[test]
    fn test_clean_until_something_fails() {
        let mut report = empty_report();
        report.members.insert(MemberId::new(1), MemberReport::new());
        assert!(report.is_clean());

        report.members.insert(
            MemberId::new(2),
            MemberReport::failed(SessionStage::Connecting, "unreachable"),
        );
        assert!(!report.is_clean());
    }

    #[test]
    fn test_failed_commit_dirties_the_report() {
        let mut report = empty_report();
        let mut member = MemberReport::new();
        member.failed_commits.push(FailedCommit {
            mapping_id: MappingId::new(1),
            category: Category::new("contacts"),
            unique_id: UniqueId::new("u1"),
            attempts: 3,
            reason: "injected failure".into(),
        });
        report.members.insert(MemberId::new(1), member);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_summary_line_mentions_preview() {
        let mut report = empty_report();
        report.preview = true;
        let line = report.to_string();
        assert!(line.contains("[preview]"));
        assert!(line.contains("session 000000000000abcd"));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let mut report = empty_report();
        report.members.insert(MemberId::new(1), MemberReport::new());
        let json = serde_json::to_string(&report).unwrap();
        let back: SessionReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, report.session_id);
        assert_eq!(back.members.len(), 1);
    }
}
