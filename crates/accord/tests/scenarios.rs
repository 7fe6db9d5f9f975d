//! End-to-end synchronization scenarios over the public API.

use std::sync::Arc;

use bytes::Bytes;

use accord::engine::memory::InMemoryMember;
use accord::{
    Category, EngineError, FilterRule, Group, GroupConfig, GroupError, MemberId, MemoryStore,
    SqliteStore, UniqueId,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn contacts() -> Category {
    Category::new("contacts")
}

fn events() -> Category {
    Category::new("events")
}

fn uid(s: &str) -> UniqueId {
    UniqueId::new(s)
}

/// Build a group of in-memory members over the given store, returning the
/// member handles alongside.
fn group_of<S: accord::Store + 'static>(
    store: S,
    specs: &[(&str, &[Category])],
) -> (Group<S>, Vec<Arc<InMemoryMember>>) {
    let mut group = Group::new(store, GroupConfig::default());
    let mut handles = Vec::new();
    for (name, categories) in specs {
        let member = Arc::new(InMemoryMember::new(*name, categories.iter().cloned()));
        group.add_member(Arc::clone(&member) as Arc<dyn accord::Member>);
        handles.push(member);
    }
    (group, handles)
}

#[tokio::test]
async fn test_bidirectional_changes_cross_in_one_pass() {
    init_tracing();
    let (group, handles) = group_of(
        MemoryStore::new(),
        &[("phone", &[contacts()]), ("laptop", &[contacts()])],
    );
    handles[0].upsert_item(contacts(), uid("a"), "alice").await;
    handles[1].upsert_item(contacts(), uid("b"), "bob").await;

    let report = group.synchronize().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.planned, 2);
    assert_eq!(handles[0].get_item(&contacts(), &uid("b")).await, Some(Bytes::from_static(b"bob")));
    assert_eq!(
        handles[1].get_item(&contacts(), &uid("a")).await,
        Some(Bytes::from_static(b"alice"))
    );
    assert_eq!(handles[0].item_count(&contacts()).await, 2);
    assert_eq!(handles[1].item_count(&contacts()).await, 2);
}

#[tokio::test]
async fn test_categories_route_independently() {
    init_tracing();
    let both: &[Category] = &[contacts(), events()];
    let (group, handles) = group_of(
        MemoryStore::new(),
        &[("phone", both), ("laptop", both), ("watch", &[contacts()])],
    );
    handles[0].upsert_item(contacts(), uid("c1"), "carol").await;
    handles[0].upsert_item(events(), uid("e1"), "standup").await;

    let report = group.synchronize().await.unwrap();
    assert!(report.is_clean());

    // The contact reaches everyone; the event only reaches members that
    // serve the events category.
    assert!(handles[1].get_item(&contacts(), &uid("c1")).await.is_some());
    assert!(handles[2].get_item(&contacts(), &uid("c1")).await.is_some());
    assert!(handles[1].get_item(&events(), &uid("e1")).await.is_some());
    assert_eq!(handles[2].get_item(&events(), &uid("e1")).await, None);
}

#[tokio::test]
async fn test_filter_rules_and_predicates_gate_propagation() {
    init_tracing();
    let (mut group, handles) = group_of(
        MemoryStore::new(),
        &[("phone", &[contacts()]), ("laptop", &[contacts()]), ("watch", &[contacts()])],
    );

    // Oversized payloads never reach the watch; contacts otherwise flow.
    group.register_predicate("oversized", |_source, _dest, record| {
        record.payload.as_ref().map(|p| p.len() > 16).unwrap_or(false)
    });
    group
        .add_filter_rule(
            FilterRule::deny()
                .to_member(MemberId::new(3))
                .with_predicate("oversized"),
        )
        .unwrap();

    handles[0].upsert_item(contacts(), uid("small"), "ok").await;
    handles[0]
        .upsert_item(contacts(), uid("large"), "0123456789abcdef-and-then-some")
        .await;

    let report = group.synchronize().await.unwrap();
    assert!(report.is_clean());

    assert_eq!(handles[1].item_count(&contacts()).await, 2);
    assert!(handles[2].get_item(&contacts(), &uid("small")).await.is_some());
    assert_eq!(handles[2].get_item(&contacts(), &uid("large")).await, None);
}

#[tokio::test]
async fn test_marker_survives_reopen_and_replays() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accord.db");

    let phone = Arc::new(InMemoryMember::new("phone", [contacts()]));
    let laptop = Arc::new(InMemoryMember::new("laptop", [contacts()]));
    phone.upsert_item(contacts(), uid("u1"), "alice").await;
    laptop.fail_commits(3).await;

    {
        let mut group = Group::new(SqliteStore::open(&path).unwrap(), GroupConfig::default());
        group.add_member(Arc::clone(&phone) as Arc<dyn accord::Member>);
        group.add_member(Arc::clone(&laptop) as Arc<dyn accord::Member>);

        let report = group.synchronize().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.members[&MemberId::new(2)].failed_commits.len(), 1);
        assert_eq!(laptop.get_item(&contacts(), &uid("u1")).await, None);
    }

    // Reopen the same database as a new group, as after a restart. The
    // in-flight marker is replayed from the archive before anything else.
    let mut group = Group::new(SqliteStore::open(&path).unwrap(), GroupConfig::default());
    group.add_member(Arc::clone(&phone) as Arc<dyn accord::Member>);
    group.add_member(Arc::clone(&laptop) as Arc<dyn accord::Member>);

    let report = group.synchronize().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(report.is_clean());
    assert_eq!(
        laptop.get_item(&contacts(), &uid("u1")).await,
        Some(Bytes::from_static(b"alice"))
    );

    // And the pass after that has nothing left to do.
    let report = group.synchronize().await.unwrap();
    assert_eq!(report.replayed, 0);
    assert_eq!(report.planned, 0);
}

#[tokio::test]
async fn test_late_member_backfilled_after_resync() {
    init_tracing();
    let (mut group, mut handles) = group_of(
        MemoryStore::new(),
        &[("phone", &[contacts()]), ("laptop", &[contacts()])],
    );
    handles[0].upsert_item(contacts(), uid("u1"), "alice").await;
    group.synchronize().await.unwrap();

    // A member added later sees nothing until established state is
    // re-reported.
    let tablet = Arc::new(InMemoryMember::new("tablet", [contacts()]));
    let tablet_id = group.add_member(Arc::clone(&tablet) as Arc<dyn accord::Member>);
    assert_eq!(tablet_id, MemberId::new(3));
    handles.push(Arc::clone(&tablet));

    let report = group.synchronize().await.unwrap();
    assert_eq!(report.planned, 0);
    assert_eq!(tablet.get_item(&contacts(), &uid("u1")).await, None);

    group.resync(MemberId::new(1), &contacts()).await.unwrap();
    let report = group.synchronize().await.unwrap();
    assert!(report.is_clean());
    assert!(tablet.get_item(&contacts(), &uid("u1")).await.is_some());
    // The member that already held the record is not duplicated.
    assert_eq!(handles[1].item_count(&contacts()).await, 1);
}

#[tokio::test]
async fn test_abort_handle_through_the_facade() {
    init_tracing();
    let (group, handles) = group_of(
        MemoryStore::new(),
        &[("phone", &[contacts()]), ("laptop", &[contacts()])],
    );
    handles[0].upsert_item(contacts(), uid("u1"), "alice").await;

    let session = group.session();
    session.abort_handle().abort();
    let result = session.run().await;
    assert!(matches!(result, Err(EngineError::Aborted)));

    // The group's next full pass is unaffected.
    let report = group.synchronize().await.unwrap();
    assert!(report.is_clean());
    assert!(handles[1].get_item(&contacts(), &uid("u1")).await.is_some());
}

#[tokio::test]
async fn test_remove_member_stops_its_propagation() {
    init_tracing();
    let (mut group, handles) = group_of(
        MemoryStore::new(),
        &[("phone", &[contacts()]), ("laptop", &[contacts()])],
    );
    handles[0].upsert_item(contacts(), uid("u1"), "alice").await;
    group.synchronize().await.unwrap();

    group.remove_member(MemberId::new(2)).unwrap();
    assert!(matches!(
        group.remove_member(MemberId::new(2)),
        Err(GroupError::UnknownMember(_))
    ));

    handles[0].upsert_item(contacts(), uid("u1"), "renamed").await;
    let report = group.synchronize().await.unwrap();
    // Nobody is left to receive the update.
    assert_eq!(report.planned, 0);
    assert_eq!(
        handles[1].get_item(&contacts(), &uid("u1")).await,
        Some(Bytes::from_static(b"alice"))
    );
}
