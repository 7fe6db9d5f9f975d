//! Proptest generators for property-based testing.

use proptest::prelude::*;

use accord_core::{Category, ChangeKind, ChangeRecord, Fingerprint, FormatTag, MemberId, UniqueId};
use bytes::Bytes;

/// Generate a member id.
pub fn member_id() -> impl Strategy<Value = MemberId> {
    (1u32..=64u32).prop_map(MemberId::new)
}

/// Generate a category name.
pub fn category() -> impl Strategy<Value = Category> {
    "[a-z][a-z0-9]{2,11}".prop_map(Category::new)
}

/// Generate a record id.
pub fn unique_id() -> impl Strategy<Value = UniqueId> {
    "[A-Za-z0-9][A-Za-z0-9-]{0,23}".prop_map(UniqueId::new)
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a fingerprint backed by a real payload.
pub fn fingerprint() -> impl Strategy<Value = Fingerprint> {
    payload(64).prop_map(|p| Fingerprint::of_payload(&p))
}

/// Generate a change kind a member can report.
pub fn change_kind() -> impl Strategy<Value = ChangeKind> {
    prop_oneof![
        Just(ChangeKind::Added),
        Just(ChangeKind::Modified),
        Just(ChangeKind::Deleted),
    ]
}

/// Generate a format tag.
pub fn format_tag() -> impl Strategy<Value = FormatTag> {
    prop_oneof![
        Just("text/x-vcard"),
        Just("text/calendar"),
        Just("text/plain"),
        Just("application/json"),
    ]
    .prop_map(FormatTag::new)
}

/// Generate a change record whose fingerprint matches its payload.
pub fn change_record() -> impl Strategy<Value = ChangeRecord> {
    (category(), unique_id(), payload(256), format_tag(), change_kind()).prop_map(
        |(category, unique_id, payload, format, kind)| match kind {
            ChangeKind::Deleted => ChangeRecord::deletion(category, unique_id, format),
            _ => ChangeRecord::with_payload(
                category,
                unique_id,
                Fingerprint::of_payload(&payload),
                Bytes::from(payload),
                format,
                kind,
            ),
        },
    )
}

/// Parameters for seeding one category with distinct records.
#[derive(Debug, Clone)]
pub struct ItemBatch {
    pub category: Category,
    pub items: Vec<(UniqueId, Vec<u8>)>,
}

impl Arbitrary for ItemBatch {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            category(),
            prop::collection::btree_map("[a-z0-9]{1,16}", payload(128), 0..24),
        )
            .prop_map(|(category, items)| ItemBatch {
                category,
                items: items
                    .into_iter()
                    .map(|(id, payload)| (UniqueId::new(id), payload))
                    .collect(),
            })
            .boxed()
    }
}

/// Fingerprint table entries for a batch, as a store would persist them.
pub fn entries_from_batch(batch: &ItemBatch) -> Vec<(UniqueId, Fingerprint)> {
    batch
        .items
        .iter()
        .map(|(id, payload)| (id.clone(), Fingerprint::of_payload(payload)))
        .collect()
}
