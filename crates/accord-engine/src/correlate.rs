//! Identity correlation: linking a first-seen record to its counterparts.
//!
//! When a member reports a record the engine has never mapped, something
//! must decide whether it is a brand new entity or the local copy of an
//! entity another member already contributed. That decision is a
//! pluggable strategy; the engine only takes the resulting hint and feeds
//! it to `MappingTable::find_or_create`, which treats a dangling hint as
//! no hint.

use accord_core::{ChangeRecord, MappingId, MappingTable, MemberId};

/// Produces the grouping hint for a record with no existing mapping.
pub trait Correlator: Send + Sync {
    /// The mapping this record most likely belongs to, if any.
    fn correlate(
        &self,
        member: MemberId,
        record: &ChangeRecord,
        table: &MappingTable,
    ) -> Option<MappingId>;
}

/// Correlates by unique id: propagation keeps ids stable across members,
/// so a record with the same (category, unique id) under any member is
/// the same entity. This is the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct UidCorrelator;

impl Correlator for UidCorrelator {
    fn correlate(
        &self,
        _member: MemberId,
        record: &ChangeRecord,
        table: &MappingTable,
    ) -> Option<MappingId> {
        table
            .all_mappings()
            .find(|mapping| {
                mapping.category() == &record.category
                    && mapping
                        .entries()
                        .any(|entry| entry.unique_id == record.unique_id)
            })
            .map(|mapping| mapping.id())
    }
}

/// Never correlates; every first-seen record becomes its own mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCorrelator;

impl Correlator for NullCorrelator {
    fn correlate(
        &self,
        _member: MemberId,
        _record: &ChangeRecord,
        _table: &MappingTable,
    ) -> Option<MappingId> {
        None
    }
}
