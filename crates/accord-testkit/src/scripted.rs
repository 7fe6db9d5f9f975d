//! Scripted members for driving the coordinator into edge cases.
//!
//! [`InMemoryMember`] behaves like a real device. The scripted member
//! instead answers each command exactly the way the test told it to,
//! which is what timeout, ordering, and failure-isolation tests need.
//!
//! [`InMemoryMember`]: accord_engine::memory::InMemoryMember

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use accord_core::{AnchorToken, Category, ChangeKind, ChangeRecord, Fingerprint, FormatTag, UniqueId};
use accord_engine::{CommitRequest, Member, MemberError, MemberInfo, MemberResult};

/// What a scripted command should do when it arrives.
#[derive(Debug, Clone)]
pub enum Action {
    /// Answer normally.
    Succeed,
    /// Fail with the given reason.
    Fail(String),
    /// Never answer. The session's member timeout decides the outcome.
    Stall,
}

#[derive(Debug, Default)]
struct Inner {
    connect: VecDeque<Action>,
    fetch: VecDeque<Action>,
    commit: VecDeque<Action>,
    sync_done: VecDeque<Action>,
    disconnect: VecDeque<Action>,
    reports: Vec<ChangeRecord>,
    commits: Vec<CommitRequest>,
    calls: Vec<&'static str>,
}

/// A member whose next answers are chosen by the test.
///
/// Commands without a scripted [`Action`] answer normally; scripted
/// actions are consumed in order, one per call. Anchor tokens derive
/// from the member name, so a rebuilt member presents the same identity.
pub struct ScriptedMember {
    name: String,
    anchors: BTreeMap<Category, AnchorToken>,
    inner: Mutex<Inner>,
}

impl ScriptedMember {
    pub fn new(name: impl Into<String>, categories: impl IntoIterator<Item = Category>) -> Self {
        let name = name.into();
        let anchors = categories
            .into_iter()
            .map(|category| {
                let token = AnchorToken::new(format!("{name}:{category}"));
                (category, token)
            })
            .collect();
        Self {
            name,
            anchors,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Script the next connect answer.
    pub fn on_connect(&self, action: Action) {
        self.inner.lock().unwrap().connect.push_back(action);
    }

    /// Script the next fetch answer.
    pub fn on_fetch(&self, action: Action) {
        self.inner.lock().unwrap().fetch.push_back(action);
    }

    /// Script the next commit answer.
    pub fn on_commit(&self, action: Action) {
        self.inner.lock().unwrap().commit.push_back(action);
    }

    /// Script the next completion answer.
    pub fn on_sync_done(&self, action: Action) {
        self.inner.lock().unwrap().sync_done.push_back(action);
    }

    /// Script the next disconnect answer.
    pub fn on_disconnect(&self, action: Action) {
        self.inner.lock().unwrap().disconnect.push_back(action);
    }

    /// Queue a record for the next fetch.
    pub fn will_report(&self, record: ChangeRecord) {
        self.inner.lock().unwrap().reports.push(record);
    }

    /// Queue an added-record report with a payload-derived fingerprint.
    pub fn will_report_item(
        &self,
        category: Category,
        unique_id: UniqueId,
        payload: impl Into<Bytes>,
    ) {
        let payload = payload.into();
        self.will_report(ChangeRecord::with_payload(
            category,
            unique_id,
            Fingerprint::of_payload(&payload),
            payload,
            FormatTag::new("application/octet-stream"),
            ChangeKind::Added,
        ));
    }

    /// Every commit request accepted so far, in order.
    pub fn commits(&self) -> Vec<CommitRequest> {
        self.inner.lock().unwrap().commits.clone()
    }

    /// The command names received so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl Member for ScriptedMember {
    async fn connect(&self) -> MemberResult<MemberInfo> {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push("connect");
            inner.connect.pop_front().unwrap_or(Action::Succeed)
        };
        match action {
            Action::Succeed => Ok(MemberInfo {
                anchors: self.anchors.clone(),
            }),
            Action::Fail(reason) => Err(MemberError::Connect(reason)),
            Action::Stall => std::future::pending().await,
        }
    }

    async fn get_changes(&self, with_data: bool) -> MemberResult<mpsc::Receiver<ChangeRecord>> {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push("fetch");
            inner.fetch.pop_front().unwrap_or(Action::Succeed)
        };
        match action {
            Action::Succeed => {
                let mut records = std::mem::take(&mut self.inner.lock().unwrap().reports);
                if !with_data {
                    for record in &mut records {
                        record.payload = None;
                    }
                }
                let (tx, rx) = mpsc::channel(records.len().max(1));
                for record in records {
                    // Capacity covers every record; the send cannot block.
                    let _ = tx.try_send(record);
                }
                Ok(rx)
            }
            Action::Fail(reason) => Err(MemberError::Fetch(reason)),
            Action::Stall => std::future::pending().await,
        }
    }

    async fn commit_change(&self, request: CommitRequest) -> MemberResult<Fingerprint> {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push("commit");
            inner.commit.pop_front().unwrap_or(Action::Succeed)
        };
        match action {
            Action::Succeed => {
                let fingerprint = match request.payload.as_deref() {
                    Some(payload) => Fingerprint::of_payload(payload),
                    None => Fingerprint::new(""),
                };
                self.inner.lock().unwrap().commits.push(request);
                Ok(fingerprint)
            }
            Action::Fail(reason) => Err(MemberError::Commit(reason)),
            Action::Stall => std::future::pending().await,
        }
    }

    async fn sync_done(&self) -> MemberResult<()> {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push("sync_done");
            inner.sync_done.pop_front().unwrap_or(Action::Succeed)
        };
        match action {
            Action::Succeed => Ok(()),
            Action::Fail(reason) => Err(MemberError::Finish(reason)),
            Action::Stall => std::future::pending().await,
        }
    }

    async fn disconnect(&self) -> MemberResult<()> {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push("disconnect");
            inner.disconnect.pop_front().unwrap_or(Action::Succeed)
        };
        match action {
            Action::Succeed => Ok(()),
            Action::Fail(reason) => Err(MemberError::Disconnect(reason)),
            Action::Stall => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use accord::{Group, GroupConfig};
    use accord_engine::memory::InMemoryMember;
    use accord_engine::{MemberOutcome, SessionConfig, SessionStage};
    use accord_store::MemoryStore;

    fn contacts() -> Category {
        Category::new("contacts")
    }

    #[tokio::test]
    async fn test_unscripted_commands_answer_normally() {
        let member = ScriptedMember::new("phone", [contacts()]);

        let info = member.connect().await.unwrap();
        assert!(info.anchors.contains_key(&contacts()));

        let mut rx = member.get_changes(true).await.unwrap();
        assert!(rx.recv().await.is_none());

        member.sync_done().await.unwrap();
        member.disconnect().await.unwrap();
        assert_eq!(member.calls(), vec!["connect", "fetch", "sync_done", "disconnect"]);
    }

    #[tokio::test]
    async fn test_scripted_answers_are_consumed_in_order() {
        let member = ScriptedMember::new("phone", [contacts()]);
        member.on_connect(Action::Fail("network down".into()));

        assert!(member.connect().await.is_err());
        assert!(member.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_stall_holds_until_the_caller_gives_up() {
        let member = ScriptedMember::new("slow", [contacts()]);
        member.on_connect(Action::Stall);

        let result = tokio::time::timeout(Duration::from_millis(20), member.connect()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_queued_reports_drain_on_fetch() {
        let member = ScriptedMember::new("phone", [contacts()]);
        member.will_report_item(contacts(), UniqueId::new("u1"), Bytes::from_static(b"alice"));

        member.connect().await.unwrap();
        let mut rx = member.get_changes(true).await.unwrap();
        let record = rx.recv().await.unwrap();
        assert_eq!(record.unique_id, UniqueId::new("u1"));
        assert_eq!(record.fingerprint, Fingerprint::of_payload(b"alice"));
        assert!(rx.recv().await.is_none());

        let mut rx = member.get_changes(true).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_session_timeout_isolates_a_stalled_member() {
        let config = GroupConfig {
            session: SessionConfig {
                member_timeout: Duration::from_millis(50),
                ..SessionConfig::default()
            },
        };
        let mut group = Group::new(MemoryStore::new(), config);

        let healthy = Arc::new(InMemoryMember::new("healthy", vec![contacts()]));
        healthy
            .upsert_item(contacts(), UniqueId::new("u1"), Bytes::from_static(b"alice"))
            .await;
        let stalled = Arc::new(ScriptedMember::new("stalled", [contacts()]));
        stalled.on_connect(Action::Stall);

        let healthy_id = group.add_member(healthy);
        let stalled_id = group.add_member(stalled);

        let report = group.synchronize().await.unwrap();
        assert!(report.members[&healthy_id].outcome.is_completed());
        match &report.members[&stalled_id].outcome {
            MemberOutcome::Failed { stage, reason } => {
                assert_eq!(*stage, SessionStage::Connecting);
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected a timeout failure, got {other:?}"),
        }
    }
}
