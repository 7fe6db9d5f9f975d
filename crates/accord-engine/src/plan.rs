//! Commit planning: turning classified changes into propagation pairs.
//!
//! Planning is pure. It reads the mapping table, the filter chain and the
//! fetched records, and produces the list of commits the session should
//! issue plus the conflicts it must report. Nothing here touches members
//! or storage; the coordinator executes the plan.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;

use accord_core::{
    ArchiveId, Category, ChangeKind, ChangeRecord, FormatTag, MappingId, MappingTable, MemberId,
    UniqueId,
};
use accord_filter::FilterChain;

use crate::conflict::{Conflict, ConflictAction, ConflictPolicy};

/// Key for looking up a fetched record: who reported it, where.
pub type FetchKey = (MemberId, Category, UniqueId);

/// One propagation the session intends to perform.
#[derive(Debug, Clone)]
pub struct PlannedCommit {
    pub mapping_id: MappingId,
    pub source: MemberId,
    pub dest: MemberId,
    pub category: Category,
    /// The unique id at the destination (the destination's own id when it
    /// already holds the entity, the source's id when this is an add).
    pub unique_id: UniqueId,
    /// The operation as the destination sees it.
    pub kind: ChangeKind,
    pub payload: Option<Bytes>,
    pub format: FormatTag,
    /// A stale in-flight archive reference on the destination entry,
    /// superseded by this commit and dropped once it confirms.
    pub supersedes: Option<ArchiveId>,
}

/// What reconciliation decided.
#[derive(Debug, Default)]
pub struct Plan {
    pub commits: Vec<PlannedCommit>,
    pub conflicts: Vec<Conflict>,
}

/// Build the commit plan for one session.
///
/// `targets` lists the members that completed fetching, with the
/// categories each serves; only those are eligible destinations.
/// `fetched` holds the session's classified records, including synthetic
/// deletion records for implicit deletions.
///
/// Entries carrying an archive reference are interrupted propagations
/// owned by the recovery machinery; they are not treated as reported
/// changes here, neither as sources nor as conflict sides.
pub fn build_plan(
    table: &MappingTable,
    chain: &FilterChain,
    policy: &dyn ConflictPolicy,
    fetched: &HashMap<FetchKey, ChangeRecord>,
    targets: &BTreeMap<MemberId, BTreeSet<Category>>,
) -> Plan {
    let mut plan = Plan::default();

    for mapping in table.all_mappings() {
        let category = mapping.category();

        // 1. Collect this session's reported dirt.
        let fresh: Vec<_> = mapping
            .entries()
            .filter(|entry| entry.dirty && entry.archive_id.is_none())
            .collect();
        if fresh.is_empty() {
            continue;
        }

        // 2. More than one side changed: divert to the conflict report.
        if fresh.len() > 1 {
            match policy.resolve(mapping) {
                ConflictAction::Report => plan.conflicts.push(Conflict::of_mapping(mapping)),
            }
            continue;
        }
        let source_entry = fresh[0];
        let source = source_entry.member;

        let key = (source, category.clone(), source_entry.unique_id.clone());
        let record = match fetched.get(&key) {
            Some(record) => record,
            None => {
                tracing::debug!(
                    member = %source,
                    unique_id = %source_entry.unique_id,
                    "dirty entry without a fetched record, skipping"
                );
                continue;
            }
        };

        // 3. Fan out to every other member serving this category.
        for (&dest, served) in targets {
            if dest == source || !served.contains(category) {
                continue;
            }

            // 4. The filter chain may veto the pair.
            if !chain.evaluate(source, dest, category, record).is_allowed() {
                tracing::debug!(
                    %source,
                    %dest,
                    unique_id = %source_entry.unique_id,
                    "propagation denied by filter"
                );
                continue;
            }

            // 5. Derive the destination-side operation.
            let dest_entry = mapping.entry(dest);
            let (kind, unique_id) = match (source_entry.kind, dest_entry) {
                // Deleting something the destination never had is a no-op.
                (ChangeKind::Deleted, None) => continue,
                (ChangeKind::Deleted, Some(existing)) => {
                    (ChangeKind::Deleted, existing.unique_id.clone())
                }
                (_, Some(existing)) => (ChangeKind::Modified, existing.unique_id.clone()),
                (_, None) => (ChangeKind::Added, source_entry.unique_id.clone()),
            };

            plan.commits.push(PlannedCommit {
                mapping_id: mapping.id(),
                source,
                dest,
                category: category.clone(),
                unique_id,
                kind,
                payload: record.payload.clone(),
                format: record.format.clone(),
                supersedes: dest_entry.and_then(|entry| entry.archive_id),
            });
        }
    }

    plan
}
