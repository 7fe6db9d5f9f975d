//! Session coordination: one full synchronization pass across a group.
//!
//! A session walks a fixed sequence of stages. Members are connected and
//! fetched in parallel, classification and identity bookkeeping run on the
//! coordinator task as the single writer, planned commits fan out with one
//! task per destination, and every member's durable state lands through one
//! end-of-pass transaction. A member that fails drops out of the session;
//! the others keep going.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;

use accord_core::{
    AnchorToken, ArchiveId, Category, ChangeKind, ChangeRecord, Fingerprint, FormatTag, HashTable,
    MappingEntry, MappingId, MappingTable, MemberId, UniqueId,
};
use accord_filter::FilterChain;
use accord_store::{
    ArchivedChange, CommitConfirmation, DeleteConfirmation, FinalizeRequest, Store, StoreError,
    StoreExt,
};

use crate::conflict::ConflictPolicy;
use crate::correlate::Correlator;
use crate::error::{EngineError, Result};
use crate::member::{CommitRequest, Member, MemberError, MemberInfo, MemberResult};
use crate::plan::{build_plan, FetchKey, PlannedCommit};
use crate::report::{FailedCommit, MemberOutcome, MemberReport, SessionReport, SessionStage};

/// Format tag attached to deletion records the engine synthesizes itself.
const SYNTHETIC_FORMAT: &str = "application/octet-stream";

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout applied to every member command.
    pub member_timeout: Duration,
    /// How many times a commit is attempted before it is recorded as
    /// failed and left for recovery.
    pub commit_attempts: u32,
    /// Whether fetches carry payloads. Preview sessions always fetch
    /// metadata only, regardless of this flag.
    pub with_payloads: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            member_timeout: Duration::from_secs(30),
            commit_attempts: 3,
            with_payloads: true,
        }
    }
}

/// Cooperative cancellation for a running session.
///
/// Abort is observed at stage boundaries and between commits, never in the
/// middle of a durable write, so the store stays consistent and interrupted
/// propagations are replayed by the next session.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Request the session to stop. Idempotent.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// What one member's pass contributes to its end-of-pass transaction.
#[derive(Debug, Default)]
struct PassLog {
    upserts: Vec<(UniqueId, Fingerprint)>,
    deletes: Vec<UniqueId>,
}

/// The per-commit result a destination task hands back.
#[derive(Debug)]
enum CommitResult {
    Applied {
        fingerprint: Fingerprint,
    },
    Deleted,
    Failed {
        archive_id: ArchiveId,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug)]
struct CommitOutcome {
    commit: PlannedCommit,
    result: CommitResult,
}

/// Coordinator for one synchronization session.
///
/// Built fresh per pass; [`Coordinator::run`] and [`Coordinator::preview`]
/// consume it. The mapping table is loaded from the store at the start and
/// only this task mutates it.
pub struct Coordinator<'a, S> {
    /// Durable sync state.
    store: Arc<S>,
    /// The group's members, keyed by their engine-assigned ids.
    members: &'a BTreeMap<MemberId, Arc<dyn Member>>,
    /// Propagation policy.
    chain: &'a FilterChain,
    /// Matches unmapped reports to existing identities.
    correlator: &'a dyn Correlator,
    /// Decides what to do when more than one member changed an entity.
    policy: &'a dyn ConflictPolicy,
    config: SessionConfig,
    abort_tx: Arc<watch::Sender<bool>>,
    abort_rx: watch::Receiver<bool>,
}

impl<'a, S: Store + 'static> Coordinator<'a, S> {
    /// Create a coordinator for one pass over the given members.
    pub fn new(
        store: Arc<S>,
        members: &'a BTreeMap<MemberId, Arc<dyn Member>>,
        chain: &'a FilterChain,
        correlator: &'a dyn Correlator,
        policy: &'a dyn ConflictPolicy,
        config: SessionConfig,
    ) -> Self {
        let (abort_tx, abort_rx) = watch::channel(false);
        Self {
            store,
            members,
            chain,
            correlator,
            policy,
            config,
            abort_tx: Arc::new(abort_tx),
            abort_rx,
        }
    }

    /// A handle that can stop this session from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: Arc::clone(&self.abort_tx),
        }
    }

    /// Run a full pass: detect, reconcile, propagate, finalize.
    pub async fn run(mut self) -> Result<SessionReport> {
        self.execute(false).await
    }

    /// Run a read-only pass that reports what a full pass would do.
    ///
    /// Fetches are metadata-only and nothing durable is written: no hash
    /// resets, no archive rows, no mapping rows, no anchors.
    pub async fn preview(mut self) -> Result<SessionReport> {
        self.execute(true).await
    }

    async fn execute(&mut self, preview: bool) -> Result<SessionReport> {
        let session_id: u64 = rand::random();
        let mut report = SessionReport {
            session_id,
            started_at_ms: now_millis(),
            finished_at_ms: 0,
            preview,
            members: BTreeMap::new(),
            slow_synced: Vec::new(),
            replayed: 0,
            planned: 0,
            conflicts: Vec::new(),
        };
        tracing::info!(
            session_id,
            members = self.members.len(),
            preview,
            "sync session starting"
        );

        let mappings = self.store.load_mappings().await?;
        let mut table = MappingTable::from_mappings(mappings)?;

        // Phase 1: connect every member in parallel
        let infos = self.connect_all(&mut report).await;

        // The remaining stages share a teardown path: whatever happens,
        // connected members get a disconnect.
        let result = self
            .drive(preview, &mut report, &mut table, &infos)
            .await;
        self.disconnect_all(&infos).await;

        result?;
        report.finished_at_ms = now_millis();
        tracing::info!(
            session_id,
            fetched = report.total_fetched(),
            applied = report.total_applied(),
            conflicts = report.conflicts.len(),
            "sync session finished"
        );
        Ok(report)
    }

    /// Everything between connect and disconnect.
    async fn drive(
        &mut self,
        preview: bool,
        report: &mut SessionReport,
        table: &mut MappingTable,
        infos: &BTreeMap<MemberId, MemberInfo>,
    ) -> Result<()> {
        self.check_abort()?;

        // Phase 2: replay propagations an earlier session left in flight
        if !preview {
            self.replay_interrupted(report, table, infos).await?;
        }

        // Phase 3: anchor comparison, then load the fingerprint tables
        let mut hash_tables = self.load_hash_tables(preview, report, infos).await?;
        self.check_abort()?;

        // Phase 4: fetch every member's reported changes in parallel
        let fetchers = self.fetch_all(preview, report).await;
        self.check_abort()?;

        // Phase 5: classify reports and group them into mappings
        let mut fetched: HashMap<FetchKey, ChangeRecord> = HashMap::new();
        let mut pass_logs: BTreeMap<(MemberId, Category), PassLog> = BTreeMap::new();
        for (&id, records) in &fetchers {
            for record in records {
                self.classify_record(
                    id,
                    record,
                    table,
                    &mut hash_tables,
                    &mut pass_logs,
                    &mut fetched,
                )?;
            }
        }

        // Phase 6: ids stored last pass and never reported are deletions
        for ((id, category), hash_table) in hash_tables.iter_mut() {
            if !fetchers.contains_key(id) {
                continue;
            }
            for unique_id in hash_table.finalize_pass() {
                tracing::debug!(member = %id, %category, %unique_id, "inferred deletion");
                pass_logs
                    .entry((*id, category.clone()))
                    .or_default()
                    .deletes
                    .push(unique_id.clone());
                if let Some(mapping_id) = table.mapping_for(*id, category, &unique_id) {
                    table.record(
                        mapping_id,
                        MappingEntry::new(*id, unique_id.clone(), ChangeKind::Deleted),
                    )?;
                }
                let record = ChangeRecord::deletion(
                    category.clone(),
                    unique_id.clone(),
                    FormatTag::new(SYNTHETIC_FORMAT),
                );
                fetched.insert((*id, category.clone(), unique_id), record);
            }
        }
        self.check_abort()?;

        // Phase 7: reconcile into a commit plan
        let targets: BTreeMap<MemberId, BTreeSet<Category>> = fetchers
            .keys()
            .filter_map(|&id| {
                infos
                    .get(&id)
                    .map(|info| (id, info.anchors.keys().cloned().collect()))
            })
            .collect();
        let plan = build_plan(table, self.chain, self.policy, &fetched, &targets);
        report.planned = plan.commits.len();
        report.conflicts = plan.conflicts;
        tracing::info!(
            planned = report.planned,
            conflicts = report.conflicts.len(),
            "reconciliation complete"
        );

        // A preview stops here, before anything durable happens.
        if preview {
            return Ok(());
        }

        // Phase 8: deliver the plan, one task per destination
        self.deliver_plan(plan.commits, report, table).await?;
        self.check_abort()?;

        // Phase 9: settle mapping entries, persist fingerprints, advance
        // anchors, and tell each member the pass is durable
        self.finalize_members(report, table, infos, &fetchers, pass_logs)
            .await?;

        Ok(())
    }

    fn check_abort(&self) -> Result<()> {
        if *self.abort_rx.borrow() {
            tracing::warn!("session aborted");
            return Err(EngineError::Aborted);
        }
        Ok(())
    }

    /// Connect members in parallel. Failures are recorded in the report and
    /// exclude the member from the rest of the session.
    async fn connect_all(&self, report: &mut SessionReport) -> BTreeMap<MemberId, MemberInfo> {
        let mut set: JoinSet<(MemberId, MemberResult<MemberInfo>)> = JoinSet::new();
        for (&id, member) in self.members {
            let member = Arc::clone(member);
            let member_timeout = self.config.member_timeout;
            set.spawn(async move {
                let result = timeout(member_timeout, member.connect())
                    .await
                    .unwrap_or_else(|_| Err(MemberError::Timeout("connecting".into())));
                (id, result)
            });
        }

        let mut infos = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "connect task aborted");
                    continue;
                }
            };
            match result {
                Ok(info) => {
                    tracing::debug!(member = %id, categories = info.anchors.len(), "member connected");
                    report.members.insert(id, MemberReport::new());
                    infos.insert(id, info);
                }
                Err(err) => {
                    tracing::warn!(member = %id, error = %err, "member failed to connect");
                    report
                        .members
                        .insert(id, MemberReport::failed(SessionStage::Connecting, err.to_string()));
                }
            }
        }
        infos
    }

    /// Re-deliver commits whose in-flight markers survived a crash or an
    /// earlier failure. Runs before change detection so a replayed record
    /// classifies as unmodified when the destination re-reports it.
    async fn replay_interrupted(
        &self,
        report: &mut SessionReport,
        table: &mut MappingTable,
        infos: &BTreeMap<MemberId, MemberInfo>,
    ) -> Result<()> {
        let mut markers = Vec::new();
        for mapping in table.all_mappings() {
            for entry in mapping.entries() {
                if entry.is_in_flight() && infos.contains_key(&entry.member) {
                    markers.push((mapping.id(), mapping.category().clone(), entry.clone()));
                }
            }
        }

        for (mapping_id, category, entry) in markers {
            let Some(archive_id) = entry.archive_id else { continue };
            let Some(member) = self.members.get(&entry.member) else { continue };

            let Some(archived) = self.store.archive_load(archive_id).await? else {
                // The payload is gone; the marker cannot be honored. Drop
                // it and let the next report from either side re-create
                // the propagation.
                tracing::warn!(
                    member = %entry.member,
                    unique_id = %entry.unique_id,
                    %archive_id,
                    "in-flight marker references a missing archive row, dropping it"
                );
                let deletion = DeleteConfirmation {
                    member: entry.member,
                    category: category.clone(),
                    mapping_id,
                    unique_id: entry.unique_id.clone(),
                    drop_archive: Some(archive_id),
                };
                self.store.confirm_delete(&deletion).await?;
                table.remove_entry(mapping_id, entry.member);
                continue;
            };

            let request = CommitRequest {
                category: archived.category.clone(),
                unique_id: archived.unique_id.clone(),
                kind: entry.kind,
                payload: if entry.kind == ChangeKind::Deleted {
                    None
                } else {
                    Some(archived.payload.clone())
                },
                format: archived.format.clone(),
            };
            match deliver_with_retry(
                member.as_ref(),
                request,
                self.config.commit_attempts,
                self.config.member_timeout,
            )
            .await
            {
                Ok(fingerprint) => {
                    if entry.kind == ChangeKind::Deleted {
                        let deletion = DeleteConfirmation {
                            member: entry.member,
                            category: category.clone(),
                            mapping_id,
                            unique_id: entry.unique_id.clone(),
                            drop_archive: Some(archive_id),
                        };
                        self.store.confirm_delete(&deletion).await?;
                        table.remove_entry(mapping_id, entry.member);
                    } else {
                        let confirmation = CommitConfirmation {
                            member: entry.member,
                            category: category.clone(),
                            mapping_id,
                            unique_id: entry.unique_id.clone(),
                            fingerprint,
                            drop_archive: Some(archive_id),
                        };
                        self.store.confirm_commit(&confirmation).await?;
                        table.record(
                            mapping_id,
                            MappingEntry::clean(entry.member, entry.unique_id.clone()),
                        )?;
                    }
                    report.replayed += 1;
                    tracing::info!(
                        member = %entry.member,
                        unique_id = %entry.unique_id,
                        "replayed interrupted propagation"
                    );
                }
                Err((attempts, reason)) => {
                    tracing::warn!(
                        member = %entry.member,
                        unique_id = %entry.unique_id,
                        attempts,
                        "replay failed, keeping the marker"
                    );
                    if let Some(member_report) = report.members.get_mut(&entry.member) {
                        member_report.failed_commits.push(FailedCommit {
                            mapping_id,
                            category: category.clone(),
                            unique_id: entry.unique_id.clone(),
                            attempts,
                            reason,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Compare anchors and build the in-memory fingerprint tables.
    ///
    /// An anchor mismatch forces a slow sync: the stored table is reset
    /// (durably, unless previewing) and every report this pass classifies
    /// as added. Identity grouping then prevents duplicates.
    async fn load_hash_tables(
        &self,
        preview: bool,
        report: &mut SessionReport,
        infos: &BTreeMap<MemberId, MemberInfo>,
    ) -> Result<BTreeMap<(MemberId, Category), HashTable>> {
        let mut hash_tables = BTreeMap::new();
        for (&id, info) in infos {
            for (category, anchor) in &info.anchors {
                let table = if self.store.requires_slow_sync(id, category, anchor).await? {
                    tracing::info!(member = %id, %category, "anchor mismatch, slow sync");
                    report.slow_synced.push((id, category.clone()));
                    if !preview {
                        self.store.reset_hashes(id, category).await?;
                    }
                    HashTable::new()
                } else {
                    let entries = self.store.load_hashes(id, category).await?;
                    HashTable::from_entries(entries)
                };
                hash_tables.insert((id, category.clone()), table);
            }
        }
        Ok(hash_tables)
    }

    /// Fetch all members in parallel, draining each change stream under a
    /// single member timeout.
    async fn fetch_all(
        &self,
        preview: bool,
        report: &mut SessionReport,
    ) -> BTreeMap<MemberId, Vec<ChangeRecord>> {
        let with_data = self.config.with_payloads && !preview;
        let mut set: JoinSet<(MemberId, MemberResult<Vec<ChangeRecord>>)> = JoinSet::new();
        for &id in report.members.keys() {
            let Some(member) = self.members.get(&id) else { continue };
            if !report.members[&id].outcome.is_completed() {
                continue;
            }
            let member = Arc::clone(member);
            let member_timeout = self.config.member_timeout;
            set.spawn(async move {
                let result = timeout(member_timeout, async {
                    let mut rx = member.get_changes(with_data).await?;
                    let mut records = Vec::new();
                    while let Some(record) = rx.recv().await {
                        records.push(record);
                    }
                    Ok(records)
                })
                .await
                .unwrap_or_else(|_| Err(MemberError::Timeout("fetching changes".into())));
                (id, result)
            });
        }

        let mut fetchers = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "fetch task aborted");
                    continue;
                }
            };
            match result {
                Ok(records) => {
                    tracing::debug!(member = %id, count = records.len(), "fetched changes");
                    if let Some(member_report) = report.members.get_mut(&id) {
                        member_report.fetched = records.len();
                    }
                    fetchers.insert(id, records);
                }
                Err(err) => {
                    tracing::warn!(member = %id, error = %err, "member failed to fetch");
                    report.members.insert(
                        id,
                        MemberReport::failed(SessionStage::FetchingChanges, err.to_string()),
                    );
                }
            }
        }
        fetchers
    }

    /// Classify one reported record against the member's fingerprint table
    /// and attach it to its mapping.
    fn classify_record(
        &self,
        id: MemberId,
        record: &ChangeRecord,
        table: &mut MappingTable,
        hash_tables: &mut BTreeMap<(MemberId, Category), HashTable>,
        pass_logs: &mut BTreeMap<(MemberId, Category), PassLog>,
        fetched: &mut HashMap<FetchKey, ChangeRecord>,
    ) -> Result<()> {
        let key = (id, record.category.clone());
        let Some(hash_table) = hash_tables.get_mut(&key) else {
            tracing::warn!(
                member = %id,
                category = %record.category,
                "report for a category the member did not announce, skipping"
            );
            return Ok(());
        };

        // The reported kind is advisory; the fingerprint table decides.
        let kind = if record.is_deletion() {
            hash_table.classify_deletion(&record.unique_id)
        } else {
            hash_table.classify(&record.unique_id, &record.fingerprint)
        };
        if kind == ChangeKind::Unmodified {
            return Ok(());
        }
        tracing::debug!(member = %id, unique_id = %record.unique_id, %kind, "classified change");

        let log = pass_logs.entry(key).or_default();
        if kind == ChangeKind::Deleted {
            log.deletes.push(record.unique_id.clone());
        } else {
            log.upserts
                .push((record.unique_id.clone(), record.fingerprint.clone()));
        }

        let hint = match table.mapping_for(id, &record.category, &record.unique_id) {
            Some(_) => None,
            None => self.correlator.correlate(id, record, table),
        };
        let entry = MappingEntry::new(id, record.unique_id.clone(), kind);
        table.find_or_create(&record.category, entry, hint)?;

        let mut normalized = record.clone();
        normalized.kind = kind;
        fetched.insert(
            (id, record.category.clone(), record.unique_id.clone()),
            normalized,
        );
        Ok(())
    }

    /// Execute the commit plan and fold the outcomes back into the mapping
    /// table and the report.
    async fn deliver_plan(
        &self,
        commits: Vec<PlannedCommit>,
        report: &mut SessionReport,
        table: &mut MappingTable,
    ) -> Result<()> {
        let mut by_dest: BTreeMap<MemberId, Vec<PlannedCommit>> = BTreeMap::new();
        for commit in commits {
            by_dest.entry(commit.dest).or_default().push(commit);
        }

        let mut set: JoinSet<(MemberId, std::result::Result<Vec<CommitOutcome>, StoreError>)> =
            JoinSet::new();
        for (dest, batch) in by_dest {
            let Some(member) = self.members.get(&dest) else { continue };
            set.spawn(deliver_to_member(
                dest,
                Arc::clone(member),
                Arc::clone(&self.store),
                batch,
                self.config.clone(),
                self.abort_rx.clone(),
            ));
        }

        while let Some(joined) = set.join_next().await {
            let (dest, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "commit task aborted");
                    continue;
                }
            };
            for outcome in result? {
                let commit = outcome.commit;
                match outcome.result {
                    CommitResult::Applied { .. } => {
                        table.record(
                            commit.mapping_id,
                            MappingEntry::clean(commit.dest, commit.unique_id.clone()),
                        )?;
                        if let Some(member_report) = report.members.get_mut(&dest) {
                            if commit.kind == ChangeKind::Added {
                                member_report.applied_adds += 1;
                            } else {
                                member_report.applied_updates += 1;
                            }
                        }
                    }
                    CommitResult::Deleted => {
                        table.remove_entry(commit.mapping_id, commit.dest);
                        if let Some(member_report) = report.members.get_mut(&dest) {
                            member_report.applied_deletes += 1;
                        }
                    }
                    CommitResult::Failed {
                        archive_id,
                        attempts,
                        reason,
                    } => {
                        // The durable marker is already in place; mirror it
                        // in memory so finalize leaves it alone.
                        table.record(
                            commit.mapping_id,
                            MappingEntry::new(commit.dest, commit.unique_id.clone(), commit.kind)
                                .with_archive(archive_id),
                        )?;
                        if let Some(member_report) = report.members.get_mut(&dest) {
                            member_report.failed_commits.push(FailedCommit {
                                mapping_id: commit.mapping_id,
                                category: commit.category.clone(),
                                unique_id: commit.unique_id.clone(),
                                attempts,
                                reason,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Settle each fetched member's mapping entries, write its pass log and
    /// anchor in one transaction, then acknowledge completion to it.
    async fn finalize_members(
        &self,
        report: &mut SessionReport,
        table: &mut MappingTable,
        infos: &BTreeMap<MemberId, MemberInfo>,
        fetchers: &BTreeMap<MemberId, Vec<ChangeRecord>>,
        mut pass_logs: BTreeMap<(MemberId, Category), PassLog>,
    ) -> Result<()> {
        for (&id, info) in infos {
            if !fetchers.contains_key(&id) {
                continue;
            }
            for (category, anchor) in &info.anchors {
                let log = pass_logs.remove(&(id, category.clone())).unwrap_or_default();
                let request =
                    self.settle_entries(id, category, anchor, log, table)?;
                self.store.finalize_pass(&request).await?;
                tracing::debug!(member = %id, %category, "pass finalized");
            }

            let Some(member) = self.members.get(&id) else { continue };
            let done = timeout(self.config.member_timeout, member.sync_done())
                .await
                .unwrap_or_else(|_| {
                    Err(MemberError::Timeout("acknowledging completion".into()))
                });
            if let Err(err) = done {
                tracing::warn!(member = %id, error = %err, "completion acknowledgement failed");
                if let Some(member_report) = report.members.get_mut(&id) {
                    member_report.outcome = MemberOutcome::Failed {
                        stage: SessionStage::Finishing,
                        reason: err.to_string(),
                    };
                }
            }
        }
        Ok(())
    }

    /// Rewrite one member's dirty entries for one category as settled and
    /// assemble its end-of-pass request. In-flight markers are skipped;
    /// they belong to recovery.
    fn settle_entries(
        &self,
        id: MemberId,
        category: &Category,
        anchor: &AnchorToken,
        log: PassLog,
        table: &mut MappingTable,
    ) -> Result<FinalizeRequest> {
        let dirty: Vec<(MappingId, MappingEntry)> = table
            .all_mappings()
            .filter(|mapping| mapping.category() == category)
            .filter_map(|mapping| mapping.entry(id).map(|entry| (mapping.id(), entry.clone())))
            .filter(|(_, entry)| entry.dirty && entry.archive_id.is_none())
            .collect();

        let mut entry_upserts = Vec::new();
        let mut entry_removals = Vec::new();
        for (mapping_id, entry) in dirty {
            if entry.kind == ChangeKind::Deleted {
                table.remove_entry(mapping_id, id);
                entry_removals.push(mapping_id);
            } else {
                let settled = MappingEntry::clean(id, entry.unique_id.clone());
                table.record(mapping_id, settled.clone())?;
                entry_upserts.push((mapping_id, settled));
            }
        }

        Ok(FinalizeRequest {
            member: id,
            category: category.clone(),
            anchor: anchor.clone(),
            hash_upserts: log.upserts,
            hash_deletes: log.deletes,
            entry_upserts,
            entry_removals,
        })
    }

    /// Disconnect every connected member. Failures are logged and ignored;
    /// the pass outcome is already decided.
    async fn disconnect_all(&self, infos: &BTreeMap<MemberId, MemberInfo>) {
        for &id in infos.keys() {
            let Some(member) = self.members.get(&id) else { continue };
            let result = timeout(self.config.member_timeout, member.disconnect())
                .await
                .unwrap_or_else(|_| Err(MemberError::Timeout("disconnecting".into())));
            if let Err(err) = result {
                tracing::warn!(member = %id, error = %err, "disconnect failed");
            }
        }
    }
}

/// Deliver one destination's commits in order.
///
/// Before each member call the payload is archived and the in-flight
/// marker written, so a crash at any point leaves a replayable trail.
/// Member failures become outcomes; store failures end the session.
async fn deliver_to_member<S: Store + 'static>(
    dest: MemberId,
    member: Arc<dyn Member>,
    store: Arc<S>,
    commits: Vec<PlannedCommit>,
    config: SessionConfig,
    abort_rx: watch::Receiver<bool>,
) -> (MemberId, std::result::Result<Vec<CommitOutcome>, StoreError>) {
    let mut outcomes = Vec::with_capacity(commits.len());
    let result: std::result::Result<(), StoreError> = async {
        for commit in commits {
            if *abort_rx.borrow() {
                tracing::warn!(member = %dest, "abort requested, stopping deliveries");
                break;
            }

            // Deletions archive an empty envelope so every marker carries
            // an archive reference the replay path can resolve.
            let archived = ArchivedChange {
                category: commit.category.clone(),
                unique_id: commit.unique_id.clone(),
                format: commit.format.clone(),
                payload: commit.payload.clone().unwrap_or_default(),
            };
            let archive_id = store.archive_store(&archived).await?;
            let marker = MappingEntry::new(commit.dest, commit.unique_id.clone(), commit.kind)
                .with_archive(archive_id);
            store.save_entry(commit.mapping_id, &commit.category, &marker).await?;
            if let Some(stale) = commit.supersedes {
                store.archive_drop(stale).await?;
            }

            let request = CommitRequest {
                category: commit.category.clone(),
                unique_id: commit.unique_id.clone(),
                kind: commit.kind,
                payload: commit.payload.clone(),
                format: commit.format.clone(),
            };
            match deliver_with_retry(
                member.as_ref(),
                request,
                config.commit_attempts,
                config.member_timeout,
            )
            .await
            {
                Ok(_) if commit.kind == ChangeKind::Deleted => {
                    let deletion = DeleteConfirmation {
                        member: dest,
                        category: commit.category.clone(),
                        mapping_id: commit.mapping_id,
                        unique_id: commit.unique_id.clone(),
                        drop_archive: Some(archive_id),
                    };
                    store.confirm_delete(&deletion).await?;
                    outcomes.push(CommitOutcome {
                        commit,
                        result: CommitResult::Deleted,
                    });
                }
                Ok(fingerprint) => {
                    let confirmation = CommitConfirmation {
                        member: dest,
                        category: commit.category.clone(),
                        mapping_id: commit.mapping_id,
                        unique_id: commit.unique_id.clone(),
                        fingerprint: fingerprint.clone(),
                        drop_archive: Some(archive_id),
                    };
                    store.confirm_commit(&confirmation).await?;
                    outcomes.push(CommitOutcome {
                        commit,
                        result: CommitResult::Applied { fingerprint },
                    });
                }
                Err((attempts, reason)) => {
                    outcomes.push(CommitOutcome {
                        commit,
                        result: CommitResult::Failed {
                            archive_id,
                            attempts,
                            reason,
                        },
                    });
                }
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => (dest, Ok(outcomes)),
        Err(err) => (dest, Err(err)),
    }
}

/// Issue one commit with bounded retries, each under the member timeout.
async fn deliver_with_retry(
    member: &dyn Member,
    request: CommitRequest,
    attempts: u32,
    member_timeout: Duration,
) -> std::result::Result<Fingerprint, (u32, String)> {
    let mut last = String::new();
    for attempt in 1..=attempts {
        let outcome = timeout(member_timeout, member.commit_change(request.clone()))
            .await
            .unwrap_or_else(|_| Err(MemberError::Timeout("committing change".into())));
        match outcome {
            Ok(fingerprint) => return Ok(fingerprint),
            Err(err) => {
                last = err.to_string();
                tracing::warn!(
                    unique_id = %request.unique_id,
                    attempt,
                    error = %last,
                    "commit attempt failed"
                );
            }
        }
    }
    Err((attempts, last))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ReportOnly;
    use crate::correlate::UidCorrelator;
    use crate::member::memory::InMemoryMember;
    use accord_store::MemoryStore;
    use bytes::Bytes;

    fn contacts() -> Category {
        Category::new("contacts")
    }

    fn uid(s: &str) -> UniqueId {
        UniqueId::new(s)
    }

    fn rig(
        count: u32,
    ) -> (
        Arc<MemoryStore>,
        Vec<Arc<InMemoryMember>>,
        BTreeMap<MemberId, Arc<dyn Member>>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        let mut members: BTreeMap<MemberId, Arc<dyn Member>> = BTreeMap::new();
        for i in 1..=count {
            let member = Arc::new(InMemoryMember::new(format!("m{i}"), [contacts()]));
            members.insert(MemberId::new(i), Arc::clone(&member) as Arc<dyn Member>);
            handles.push(member);
        }
        (store, handles, members)
    }

    async fn run_session(
        store: &Arc<MemoryStore>,
        members: &BTreeMap<MemberId, Arc<dyn Member>>,
        chain: &FilterChain,
    ) -> SessionReport {
        Coordinator::new(
            Arc::clone(store),
            members,
            chain,
            &UidCorrelator,
            &ReportOnly,
            SessionConfig::default(),
        )
        .run()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_change_propagates_to_every_other_member() {
        let (store, handles, members) = rig(3);
        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;

        let chain = FilterChain::new();
        let report = run_session(&store, &members, &chain).await;
        assert!(report.is_clean());
        assert_eq!(report.planned, 2);
        assert_eq!(report.total_applied(), 2);
        assert_eq!(
            handles[1].get_item(&contacts(), &uid("u1")).await,
            Some(Bytes::from_static(b"alice"))
        );
        assert_eq!(
            handles[2].get_item(&contacts(), &uid("u1")).await,
            Some(Bytes::from_static(b"alice"))
        );

        let mappings = store.load_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].len(), 3);
        assert!(!mappings[0].has_dirty_entries());

        // A second pass finds everything already in agreement.
        let report = run_session(&store, &members, &chain).await;
        assert!(report.is_clean());
        assert_eq!(report.planned, 0);
        assert_eq!(report.total_applied(), 0);
        assert_eq!(handles[0].sync_done_count().await, 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_follow_the_add() {
        let (store, handles, members) = rig(2);
        let chain = FilterChain::new();

        handles[0].upsert_item(contacts(), uid("u1"), "v1").await;
        run_session(&store, &members, &chain).await;
        assert_eq!(
            handles[1].get_item(&contacts(), &uid("u1")).await,
            Some(Bytes::from_static(b"v1"))
        );

        handles[0].upsert_item(contacts(), uid("u1"), "v2").await;
        let report = run_session(&store, &members, &chain).await;
        assert_eq!(report.members[&MemberId::new(2)].applied_updates, 1);
        assert_eq!(
            handles[1].get_item(&contacts(), &uid("u1")).await,
            Some(Bytes::from_static(b"v2"))
        );

        // Silent removal; the engine infers the deletion from absence.
        handles[0].remove_item(&contacts(), &uid("u1")).await;
        let report = run_session(&store, &members, &chain).await;
        assert_eq!(report.members[&MemberId::new(2)].applied_deletes, 1);
        assert_eq!(handles[1].get_item(&contacts(), &uid("u1")).await, None);
        assert!(store.load_mappings().await.unwrap().is_empty());

        // Nothing echoes back on the pass after the delete.
        let report = run_session(&store, &members, &chain).await;
        assert_eq!(report.planned, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_deny_rule_blocks_one_pair_only() {
        let (store, handles, members) = rig(3);
        let mut chain = FilterChain::new();
        chain
            .add_rule(
                accord_filter::FilterRule::deny()
                    .from_member(MemberId::new(1))
                    .to_member(MemberId::new(2)),
            )
            .unwrap();

        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;
        let report = run_session(&store, &members, &chain).await;

        assert_eq!(report.planned, 1);
        assert_eq!(handles[1].get_item(&contacts(), &uid("u1")).await, None);
        assert!(handles[2].get_item(&contacts(), &uid("u1")).await.is_some());
    }

    #[tokio::test]
    async fn test_commit_failures_are_bounded_and_leave_a_marker() {
        let (store, handles, members) = rig(3);
        let chain = FilterChain::new();
        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;
        handles[1].fail_commits(3).await;

        let report = run_session(&store, &members, &chain).await;
        assert!(!report.is_clean());
        let failed = &report.members[&MemberId::new(2)].failed_commits;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        // The failure is isolated; the third member still receives.
        assert!(handles[2].get_item(&contacts(), &uid("u1")).await.is_some());
        assert_eq!(handles[1].get_item(&contacts(), &uid("u1")).await, None);

        // The marker survives durably for the next session to replay.
        let mappings = store.load_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        let marker = mappings[0].entry(MemberId::new(2)).unwrap();
        assert!(marker.is_in_flight());

        // Injected failures are spent; the replay delivers from the archive
        // without re-fetching the source.
        let report = run_session(&store, &members, &chain).await;
        assert_eq!(report.replayed, 1);
        assert_eq!(report.planned, 0);
        assert_eq!(
            handles[1].get_item(&contacts(), &uid("u1")).await,
            Some(Bytes::from_static(b"alice"))
        );
        let mappings = store.load_mappings().await.unwrap();
        assert!(!mappings[0].has_dirty_entries());
    }

    #[tokio::test]
    async fn test_preview_writes_nothing_durable() {
        let (store, handles, members) = rig(2);
        let chain = FilterChain::new();
        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;

        let report = Coordinator::new(
            Arc::clone(&store),
            &members,
            &chain,
            &UidCorrelator,
            &ReportOnly,
            SessionConfig::default(),
        )
        .preview()
        .await
        .unwrap();

        assert!(report.preview);
        assert_eq!(report.planned, 1);
        assert_eq!(report.members[&MemberId::new(1)].fetched, 1);
        assert_eq!(report.total_applied(), 0);

        // No mappings, no anchors, no commits, no completion signal.
        assert!(store.load_mappings().await.unwrap().is_empty());
        assert!(store
            .anchor(MemberId::new(1), &contacts())
            .await
            .unwrap()
            .is_none());
        assert!(handles[1].committed().await.is_empty());
        assert_eq!(handles[0].sync_done_count().await, 0);

        // A real pass afterwards behaves as the preview promised.
        let report = run_session(&store, &members, &chain).await;
        assert_eq!(report.planned, 1);
        assert!(handles[1].get_item(&contacts(), &uid("u1")).await.is_some());
    }

    #[tokio::test]
    async fn test_abort_before_any_durable_write() {
        let (store, handles, members) = rig(2);
        let chain = FilterChain::new();
        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;

        let coordinator = Coordinator::new(
            Arc::clone(&store),
            &members,
            &chain,
            &UidCorrelator,
            &ReportOnly,
            SessionConfig::default(),
        );
        coordinator.abort_handle().abort();
        let result = coordinator.run().await;

        assert!(matches!(result, Err(EngineError::Aborted)));
        assert!(store.load_mappings().await.unwrap().is_empty());
        assert!(handles[1].committed().await.is_empty());
    }

    #[tokio::test]
    async fn test_identity_reset_forces_slow_sync_without_duplicates() {
        let (store, handles, members) = rig(2);
        let chain = FilterChain::new();

        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;
        let report = run_session(&store, &members, &chain).await;
        // First contact with the store slow-syncs everyone.
        assert_eq!(report.slow_synced.len(), 2);

        handles[0].reset_identity().await;
        let report = run_session(&store, &members, &chain).await;
        assert_eq!(report.slow_synced, vec![(MemberId::new(1), contacts())]);
        // The re-reported record resolves to the existing identity and is
        // re-delivered as an update, not duplicated.
        assert_eq!(report.planned, 1);
        assert_eq!(handles[1].item_count(&contacts()).await, 1);
        let mappings = store.load_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].len(), 2);

        // With the new anchor stored, the next pass is quiet.
        let report = run_session(&store, &members, &chain).await;
        assert!(report.slow_synced.is_empty());
        assert_eq!(report.planned, 0);
    }

    #[tokio::test]
    async fn test_concurrent_edits_reported_once_then_settled() {
        let (store, handles, members) = rig(2);
        let chain = FilterChain::new();

        handles[0].upsert_item(contacts(), uid("u1"), "base").await;
        run_session(&store, &members, &chain).await;

        handles[0].upsert_item(contacts(), uid("u1"), "left").await;
        handles[1].upsert_item(contacts(), uid("u1"), "right").await;
        let report = run_session(&store, &members, &chain).await;

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].entries.len(), 2);
        assert_eq!(report.planned, 0);
        // Neither side is clobbered.
        assert_eq!(
            handles[0].get_item(&contacts(), &uid("u1")).await,
            Some(Bytes::from_static(b"left"))
        );
        assert_eq!(
            handles[1].get_item(&contacts(), &uid("u1")).await,
            Some(Bytes::from_static(b"right"))
        );

        // Both versions are now the accepted baseline; the conflict is not
        // re-reported.
        let report = run_session(&store, &members, &chain).await;
        assert!(report.conflicts.is_empty());
        assert_eq!(report.planned, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_excludes_member_only() {
        let (store, handles, members) = rig(3);
        let chain = FilterChain::new();
        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;
        handles[2].fail_connects(1).await;

        let report = run_session(&store, &members, &chain).await;

        match &report.members[&MemberId::new(3)].outcome {
            MemberOutcome::Failed { stage, .. } => assert_eq!(*stage, SessionStage::Connecting),
            other => panic!("expected a connect failure, got {other:?}"),
        }
        assert!(handles[1].get_item(&contacts(), &uid("u1")).await.is_some());
        assert_eq!(handles[2].get_item(&contacts(), &uid("u1")).await, None);
        // The absent member holds no mapping entry yet.
        let mappings = store.load_mappings().await.unwrap();
        assert_eq!(mappings[0].len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_deletion_report_propagates() {
        let (store, handles, members) = rig(2);
        let chain = FilterChain::new();

        handles[0].upsert_item(contacts(), uid("u1"), "alice").await;
        run_session(&store, &members, &chain).await;

        handles[0].remove_item_reported(&contacts(), &uid("u1")).await;
        let report = run_session(&store, &members, &chain).await;

        assert_eq!(report.members[&MemberId::new(2)].applied_deletes, 1);
        assert_eq!(handles[1].get_item(&contacts(), &uid("u1")).await, None);
        assert!(store.load_mappings().await.unwrap().is_empty());
    }
}
