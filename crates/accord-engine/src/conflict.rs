//! Conflict detection surface.
//!
//! A mapping is conflicted when more than one member changed the same
//! entity in the same interval. The engine never merges payloads; policy
//! decides what happens, and the shipped policy only reports.

use serde::{Deserialize, Serialize};

use accord_core::{Category, ChangeKind, Mapping, MappingId, MemberId};

/// What to do with a conflicted mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Exclude the mapping from propagation and surface it in the report.
    Report,
}

/// Decides the fate of conflicted mappings.
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, mapping: &Mapping) -> ConflictAction;
}

/// The default policy: report every conflict, resolve nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportOnly;

impl ConflictPolicy for ReportOnly {
    fn resolve(&self, _mapping: &Mapping) -> ConflictAction {
        ConflictAction::Report
    }
}

/// One reported conflict: the sides that changed and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub mapping_id: MappingId,
    pub category: Category,
    /// The dirty sides and their change kinds.
    pub entries: Vec<(MemberId, ChangeKind)>,
}

impl Conflict {
    /// Summarize a conflicted mapping.
    pub fn of_mapping(mapping: &Mapping) -> Self {
        Self {
            mapping_id: mapping.id(),
            category: mapping.category().clone(),
            entries: mapping
                .dirty_entries()
                .map(|entry| (entry.member, entry.kind))
                .collect(),
        }
    }
}
