//! Sync cycle controller: the single-flight owner of the push/pull protocol.
//!
//! A cycle snapshots the change queue, pushes it, and applies the response
//! (applied ids, conflicts, server changes, new cursor) in one transaction.
//! Concurrent requests never overlap: a request arriving while a cycle runs is
//! remembered once and replayed after the running cycle completes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::auth::CredentialSource;
use super::backoff::Backoff;
use super::connectivity::{AlwaysOnline, Connectivity};
use super::error::{SyncError, SyncResult};
use super::transport::SyncTransport;
use crate::config::SyncSettings;
use crate::db::{
    finish_transaction, ConflictRepository, EntityRepository, LibSqlConflictRepository,
    LibSqlEntityRepository, LibSqlQueueRepository, LibSqlSyncStateRepository, PendingResolution,
    QueueEntry, QueueRepository, SyncStateRepository,
};
use crate::models::{ChangeAction, EntityId, EntityType, SyncMetadata, SyncStatus};
use crate::protocol::{PushRequest, PushResult, ResolveRequest};
use crate::queue::ChangeQueue;
use crate::services::DatabaseService;
use crate::util::{compact_text, truncate_timestamp};

/// What asked for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Explicit caller request
    Manual,
    /// Connectivity came back
    Reconnected,
    /// Periodic pull
    Timer,
    /// Backoff timer fired
    Retry,
}

impl SyncTrigger {
    const fn bypasses_backoff(self) -> bool {
        matches!(self, Self::Manual | Self::Reconnected)
    }

    const fn forces_pull(self) -> bool {
        matches!(self, Self::Manual | Self::Reconnected)
    }

    /// Which of two coalesced requests to replay
    const fn stronger(self, other: Self) -> Self {
        if self.forces_pull() {
            self
        } else {
            other
        }
    }
}

/// Counts from one completed cycle (or several merged by coalescing)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pushed: usize,
    pub applied: usize,
    pub conflicts: usize,
    /// Pushed but neither applied nor conflicted; retried next cycle
    pub errored: usize,
    pub server_changes_applied: usize,
    /// Server changes skipped because a local edit is still queued
    pub server_changes_deferred: usize,
    pub resolutions_acknowledged: usize,
    pub cursor: Option<DateTime<Utc>>,
}

impl CycleReport {
    fn merge(&mut self, other: &Self) {
        self.pushed += other.pushed;
        self.applied += other.applied;
        self.conflicts += other.conflicts;
        self.errored += other.errored;
        self.server_changes_applied += other.server_changes_applied;
        self.server_changes_deferred += other.server_changes_deferred;
        self.resolutions_acknowledged += other.resolutions_acknowledged;
        self.cursor = self.cursor.max(other.cursor);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was running; it will run once more when it finishes
    Coalesced,
    /// Nothing queued and no pull due; no network contact
    Skipped,
    /// The connectivity probe reported offline
    Offline,
    /// A previous failure's backoff window is still open
    BackingOff { retry_in: Duration },
}

/// Snapshot of the controller and its persisted checkpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOverview {
    pub cursor: Option<DateTime<Utc>>,
    pub migrated_at: Option<DateTime<Utc>>,
    pub queued: u64,
    pub open_conflicts: usize,
    pub status_counts: Vec<(SyncStatus, u64)>,
    pub auth_halted: bool,
    pub consecutive_failures: u32,
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Default)]
struct CycleState {
    in_flight: bool,
    rerun: Option<SyncTrigger>,
    consecutive_failures: u32,
    next_retry_at: Option<Instant>,
    auth_halted: bool,
    last_contact: Option<Instant>,
}

impl CycleState {
    fn retry_in(&self, now: Instant) -> Option<Duration> {
        self.next_retry_at
            .filter(|at| *at > now)
            .map(|at| at.duration_since(now))
    }
}

/// Holds the single-flight slot; dropping it without `release` frees the slot.
///
/// A cycle or import future can be dropped at any await point (a timeout, a
/// `select!`, process shutdown). The slot must not outlive it, or every later
/// request would coalesce into a cycle that no longer exists.
pub(crate) struct FlightSlot<'a> {
    state: &'a Mutex<CycleState>,
    held: bool,
}

impl<'a> FlightSlot<'a> {
    const fn new(state: &'a Mutex<CycleState>) -> Self {
        Self { state, held: true }
    }

    /// Give the slot back under an already-held state lock
    fn release(&mut self, state: &mut CycleState) {
        state.in_flight = false;
        self.held = false;
    }
}

impl Drop for FlightSlot<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = false;
        state.rerun = None;
        tracing::warn!("Sync work abandoned mid-flight; slot released");
    }
}

/// Work picked up by one cycle
struct CyclePlan {
    batch: Vec<QueueEntry>,
    resolutions: Vec<PendingResolution>,
    cursor: Option<DateTime<Utc>>,
}

pub struct SyncController<T> {
    db: DatabaseService,
    transport: T,
    credentials: Arc<dyn CredentialSource>,
    connectivity: Arc<dyn Connectivity>,
    backoff: Backoff,
    pull_interval: Duration,
    state: Mutex<CycleState>,
}

impl<T: SyncTransport> SyncController<T> {
    pub fn new(
        db: DatabaseService,
        transport: T,
        credentials: Arc<dyn CredentialSource>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            db,
            transport,
            credentials,
            connectivity: Arc::new(AlwaysOnline),
            backoff: Backoff::new(settings.backoff_base, settings.backoff_max),
            pull_interval: settings.pull_interval,
            state: Mutex::new(CycleState::default()),
        }
    }

    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub const fn database(&self) -> &DatabaseService {
        &self.db
    }

    pub(crate) const fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn connectivity(&self) -> &dyn Connectivity {
        self.connectivity.as_ref()
    }

    pub(crate) fn credentials(&self) -> &dyn CredentialSource {
        self.credentials.as_ref()
    }

    /// Run a cycle now, bypassing any backoff window
    pub async fn run_cycle(&self) -> SyncResult<CycleOutcome> {
        self.request(SyncTrigger::Manual).await
    }

    /// Coalescing entry point shared by every trigger source
    pub async fn request(&self, trigger: SyncTrigger) -> SyncResult<CycleOutcome> {
        let mut slot = {
            let mut state = self.cycle_state();
            if state.auth_halted {
                return Err(SyncError::AuthExpired);
            }
            if state.in_flight {
                state.rerun = Some(state.rerun.map_or(trigger, |queued| queued.stronger(trigger)));
                tracing::debug!("Sync cycle in flight; coalesced {:?} request", trigger);
                return Ok(CycleOutcome::Coalesced);
            }
            if !trigger.bypasses_backoff() {
                if let Some(retry_in) = state.retry_in(Instant::now()) {
                    return Ok(CycleOutcome::BackingOff { retry_in });
                }
            }
            state.in_flight = true;
            FlightSlot::new(&self.state)
        };

        let mut trigger = trigger;
        let mut merged: Option<CycleReport> = None;
        loop {
            tracing::debug!("Starting sync cycle ({:?})", trigger);
            let result = self.execute(trigger).await;
            let rerun = self.settle(&result, &mut slot);

            // A failed rerun is already recorded in the backoff state; the
            // earlier cycles it follows have committed and still get reported
            let outcome = match (merged.take(), result) {
                (Some(mut first), Ok(CycleOutcome::Completed(next))) => {
                    first.merge(&next);
                    Ok(CycleOutcome::Completed(first))
                }
                (Some(first), _) => Ok(CycleOutcome::Completed(first)),
                (None, outcome) => outcome,
            };

            match rerun {
                Some(next) => {
                    if let Ok(CycleOutcome::Completed(report)) = outcome {
                        merged = Some(report);
                    }
                    trigger = next;
                }
                None => return outcome,
            }
        }
    }

    /// Lift the auth halt once the host has a fresh credential
    pub fn resume_after_reauth(&self) {
        let mut state = self.cycle_state();
        if state.auth_halted {
            tracing::info!("Resuming sync after re-authentication");
        }
        state.auth_halted = false;
        state.consecutive_failures = 0;
        state.next_retry_at = None;
    }

    pub fn is_halted(&self) -> bool {
        self.cycle_state().auth_halted
    }

    /// Time until the backoff window closes, if one is open
    pub fn retry_in(&self) -> Option<Duration> {
        self.cycle_state().retry_in(Instant::now())
    }

    pub async fn overview(&self) -> SyncResult<SyncOverview> {
        let (auth_halted, consecutive_failures, retry_in) = {
            let state = self.cycle_state();
            (
                state.auth_halted,
                state.consecutive_failures,
                state.retry_in(Instant::now()),
            )
        };

        let db = self.db.lock().await;
        let conn = db.connection();
        let sync_state = LibSqlSyncStateRepository::new(conn);
        Ok(SyncOverview {
            cursor: sync_state.cursor().await?,
            migrated_at: sync_state.migrated_at().await?,
            queued: LibSqlQueueRepository::new(conn).count().await?,
            open_conflicts: LibSqlConflictRepository::new(conn).list().await?.len(),
            status_counts: LibSqlEntityRepository::new(conn).status_counts().await?,
            auth_halted,
            consecutive_failures,
            retry_in,
        })
    }

    fn cycle_state(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the single-flight slot for work other than a regular cycle
    pub(crate) fn begin_exclusive(&self) -> SyncResult<FlightSlot<'_>> {
        let mut state = self.cycle_state();
        if state.auth_halted {
            return Err(SyncError::AuthExpired);
        }
        if state.in_flight {
            return Err(SyncError::CycleInFlight);
        }
        state.in_flight = true;
        Ok(FlightSlot::new(&self.state))
    }

    /// Release the slot; returns a request coalesced in the meantime
    pub(crate) fn end_exclusive(
        &self,
        mut slot: FlightSlot<'_>,
        auth_expired: bool,
    ) -> Option<SyncTrigger> {
        let mut state = self.cycle_state();
        slot.release(&mut state);
        if auth_expired {
            state.auth_halted = true;
            state.rerun = None;
        }
        state.rerun.take()
    }

    /// Record a cycle's result; returns the coalesced request to replay, if any.
    /// The slot is released in the same critical section when nothing reruns.
    fn settle(
        &self,
        result: &SyncResult<CycleOutcome>,
        slot: &mut FlightSlot<'_>,
    ) -> Option<SyncTrigger> {
        let mut state = self.cycle_state();
        let queued = state.rerun.take();

        let rerun = match result {
            Ok(CycleOutcome::Completed(report)) => {
                state.consecutive_failures = 0;
                state.next_retry_at = None;
                state.last_contact = Some(Instant::now());
                tracing::info!(
                    "Sync cycle completed: {} pushed, {} applied, {} conflicts, {} errored, {} server changes",
                    report.pushed,
                    report.applied,
                    report.conflicts,
                    report.errored,
                    report.server_changes_applied
                );
                queued
            }
            Ok(_) => queued,
            Err(error) if error.is_retryable() => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let delay = self.backoff.delay(state.consecutive_failures);
                state.next_retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    "Sync cycle failed: {}; retrying in {:?} (attempt {})",
                    error,
                    delay,
                    state.consecutive_failures
                );
                None
            }
            Err(SyncError::AuthExpired) => {
                state.auth_halted = true;
                tracing::warn!("Sync halted: authentication expired");
                None
            }
            Err(error) => {
                tracing::error!("Sync cycle aborted: {}", error);
                None
            }
        };

        if rerun.is_none() {
            slot.release(&mut state);
        }
        rerun
    }

    async fn execute(&self, trigger: SyncTrigger) -> SyncResult<CycleOutcome> {
        if !self.connectivity.is_online() {
            tracing::debug!("Skipping sync cycle: offline");
            return Ok(CycleOutcome::Offline);
        }
        let token = self
            .credentials
            .access_token()
            .ok_or(SyncError::AuthExpired)?;

        let interval_elapsed = self
            .cycle_state()
            .last_contact
            .is_none_or(|at| at.elapsed() >= self.pull_interval);
        let Some(plan) = self.plan(trigger.forces_pull() || interval_elapsed).await? else {
            tracing::debug!("Skipping sync cycle: queue empty and no pull due");
            return Ok(CycleOutcome::Skipped);
        };

        let (result, acknowledged) = match self.exchange(&token, &plan).await {
            Ok(exchanged) => exchanged,
            Err(error) => {
                self.revert(&plan).await?;
                return Err(error);
            }
        };

        let mut report = self.apply(&plan, result).await?;
        report.resolutions_acknowledged = acknowledged;
        Ok(CycleOutcome::Completed(report))
    }

    /// Snapshot the queue and mark the batch `syncing`; `None` when there is nothing to do
    async fn plan(&self, pull_due: bool) -> SyncResult<Option<CyclePlan>> {
        let db = self.db.lock().await;
        let tx = db.begin().await?;
        let result = async {
            let entities = LibSqlEntityRepository::new(&tx);
            let conflicts = LibSqlConflictRepository::new(&tx);

            let stale = entities
                .reset_status(SyncStatus::Syncing, SyncStatus::Pending)
                .await?;
            if stale > 0 {
                tracing::info!("Reset {} entities left syncing by an interrupted cycle", stale);
            }

            let open: HashSet<(EntityType, EntityId)> = conflicts
                .list()
                .await?
                .into_iter()
                .map(|conflict| (conflict.entity_type, conflict.entity_id))
                .collect();
            let batch: Vec<QueueEntry> = ChangeQueue::new(&tx)
                .drain()
                .await?
                .into_iter()
                .filter(|entry| !open.contains(&(entry.entity_type, entry.entity_id.clone())))
                .collect();
            let resolutions = conflicts.pending_resolutions().await?;
            let cursor = LibSqlSyncStateRepository::new(&tx).cursor().await?;

            if batch.is_empty() && resolutions.is_empty() && !pull_due && cursor.is_some() {
                return Ok::<_, crate::Error>(None);
            }

            for entry in &batch {
                entities
                    .set_status(entry.entity_type, &entry.entity_id, SyncStatus::Syncing)
                    .await?;
            }

            Ok::<_, crate::Error>(Some(CyclePlan {
                batch,
                resolutions,
                cursor,
            }))
        }
        .await;
        Ok(finish_transaction(tx, result).await?)
    }

    /// All network calls of one cycle: resolution acks, then the push
    async fn exchange(&self, token: &str, plan: &CyclePlan) -> SyncResult<(PushResult, usize)> {
        let mut acknowledged = 0;
        for pending in &plan.resolutions {
            let request = ResolveRequest {
                entity_type: pending.entity_type,
                entity_id: pending.entity_id.clone(),
                resolution: pending.resolution,
            };
            self.transport.resolve(token, &request).await?;

            let db = self.db.lock().await;
            LibSqlConflictRepository::new(db.connection())
                .remove_resolution(pending.entity_type, &pending.entity_id)
                .await?;
            acknowledged += 1;
        }

        let changes = plan
            .batch
            .iter()
            .map(QueueEntry::to_change)
            .collect::<crate::Result<Vec<_>>>()?;
        let request = PushRequest {
            changes,
            last_synced_at: plan.cursor,
        };

        let response = self.transport.push(token, &request).await?;
        let result = response.validate().map_err(|error| SyncError::Server {
            status: 200,
            message: compact_text(&format!("malformed push response: {error}")),
        })?;
        Ok((result, acknowledged))
    }

    /// Put a failed cycle's batch back to `pending`; the queue itself was never touched
    async fn revert(&self, plan: &CyclePlan) -> SyncResult<()> {
        if plan.batch.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().await;
        let tx = db.begin().await?;
        let result = LibSqlEntityRepository::new(&tx)
            .reset_status(SyncStatus::Syncing, SyncStatus::Pending)
            .await;
        finish_transaction(tx, result).await?;
        Ok(())
    }

    /// Write a validated response back onto the store, queue and cursor in one transaction
    async fn apply(&self, plan: &CyclePlan, result: PushResult) -> SyncResult<CycleReport> {
        let synced_at = truncate_timestamp(result.synced_at);
        let db = self.db.lock().await;
        let tx = db.begin().await?;
        let outcome = async {
            let entities = LibSqlEntityRepository::new(&tx);
            let queue = ChangeQueue::new(&tx);
            let queue_repo = LibSqlQueueRepository::new(&tx);
            let conflicts = LibSqlConflictRepository::new(&tx);
            let mut report = CycleReport {
                pushed: plan.batch.len(),
                ..CycleReport::default()
            };

            let applied: HashSet<&EntityId> = result.applied.iter().collect();
            let conflicted: HashSet<(EntityType, &EntityId)> = result
                .conflicts
                .iter()
                .map(|conflict| (conflict.entity_type, &conflict.entity_id))
                .collect();
            let pushed: HashSet<(EntityType, &EntityId)> = plan
                .batch
                .iter()
                .map(|entry| (entry.entity_type, &entry.entity_id))
                .collect();

            for entry in &plan.batch {
                let key = (entry.entity_type, &entry.entity_id);
                if conflicted.contains(&key) {
                    continue;
                }

                if applied.contains(&entry.entity_id) {
                    let removed = queue
                        .remove_if_unchanged(
                            entry.entity_type,
                            &entry.entity_id,
                            entry.local_updated_at,
                        )
                        .await?;
                    if removed {
                        if entry.action == ChangeAction::Delete {
                            entities.purge(entry.entity_type, &entry.entity_id).await?;
                        } else {
                            entities
                                .mark_synced(entry.entity_type, &entry.entity_id, synced_at)
                                .await?;
                        }
                    } else if queue.get(entry.entity_type, &entry.entity_id).await?.is_some() {
                        // Edited again mid-cycle; the newer edit goes out next cycle
                        entities
                            .set_server_updated_at(entry.entity_type, &entry.entity_id, synced_at)
                            .await?;
                        entities
                            .set_status(entry.entity_type, &entry.entity_id, SyncStatus::Pending)
                            .await?;
                    } else if entry.action != ChangeAction::Delete {
                        // Deleted locally while its create was in flight: the server holds it now
                        let now = crate::util::now();
                        let meta = SyncMetadata {
                            sync_status: SyncStatus::Pending,
                            local_updated_at: Some(now),
                            server_updated_at: Some(synced_at),
                        };
                        entities.upsert(&entry.record, &meta, true).await?;
                        queue_repo
                            .insert(ChangeAction::Delete, &entry.record, now, now)
                            .await?;
                    }
                    report.applied += 1;
                } else {
                    let still_syncing = entities
                        .get(entry.entity_type, &entry.entity_id)
                        .await?
                        .is_some_and(|stored| stored.meta.sync_status == SyncStatus::Syncing);
                    if still_syncing {
                        entities
                            .set_status(entry.entity_type, &entry.entity_id, SyncStatus::Error)
                            .await?;
                    }
                    tracing::warn!(
                        "Server settled neither way on {} {}; will retry",
                        entry.entity_type,
                        entry.entity_id
                    );
                    report.errored += 1;
                }
            }

            for conflict in &result.conflicts {
                if queue
                    .get(conflict.entity_type, &conflict.entity_id)
                    .await?
                    .is_none()
                {
                    tracing::warn!(
                        "Ignoring conflict for {} {} without a queued change",
                        conflict.entity_type,
                        conflict.entity_id
                    );
                    continue;
                }
                conflicts.upsert(conflict, synced_at).await?;
                entities
                    .set_status(conflict.entity_type, &conflict.entity_id, SyncStatus::Conflict)
                    .await?;
                tracing::info!(
                    "Conflict detected for {} {}",
                    conflict.entity_type,
                    conflict.entity_id
                );
                report.conflicts += 1;
            }

            for change in &result.server_changes {
                let key = (change.entity_type, &change.entity_id);
                if conflicted.contains(&key)
                    || (pushed.contains(&key) && applied.contains(&change.entity_id))
                {
                    continue;
                }
                if queue
                    .get(change.entity_type, &change.entity_id)
                    .await?
                    .is_some()
                {
                    tracing::debug!(
                        "Deferring server change to {} {}: local edit queued",
                        change.entity_type,
                        change.entity_id
                    );
                    report.server_changes_deferred += 1;
                    continue;
                }

                if change.action == ChangeAction::Delete {
                    entities.purge(change.entity_type, &change.entity_id).await?;
                } else if let Some(record) = &change.record {
                    let meta = SyncMetadata::synced(truncate_timestamp(change.updated_at));
                    entities.upsert(record, &meta, false).await?;
                } else {
                    continue;
                }
                report.server_changes_applied += 1;
            }

            report.cursor = Some(
                LibSqlSyncStateRepository::new(&tx)
                    .advance_cursor(synced_at)
                    .await?,
            );
            Ok::<_, crate::Error>(report)
        }
        .await;
        Ok(finish_transaction(tx, outcome).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::{Conflict, EntityRecord, Expense, Trip};
    use crate::protocol::{PushResponse, SyncChange, WireConflict};
    use crate::sync::auth::StaticCredentials;
    use crate::sync::connectivity::ConnectivityMonitor;
    use crate::sync::testing::{ts, MidFlightEdit, ScriptedTransport};

    fn expense(id: &str, amount: f64) -> EntityRecord {
        let mut expense = Expense::new(
            EntityId::from("D1"),
            amount,
            "KRW",
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        );
        expense.id = EntityId::from(id);
        expense.created_at = ts(0);
        expense.into()
    }

    async fn controller(transport: ScriptedTransport) -> SyncController<ScriptedTransport> {
        let db = DatabaseService::open_in_memory().await.unwrap();
        SyncController::new(
            db,
            transport,
            Arc::new(StaticCredentials::new(Some("token".to_string()))),
            &SyncSettings::with_base_url("http://localhost:8080"),
        )
    }

    async fn status_of(controller: &SyncController<ScriptedTransport>, id: &str) -> SyncStatus {
        controller
            .database()
            .get(EntityType::Expense, &EntityId::from(id))
            .await
            .unwrap()
            .unwrap()
            .meta
            .sync_status
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn applied_change_clears_queue_and_stamps_server_time() {
        let transport = ScriptedTransport::default();
        transport.respond(Ok(PushResponse {
            applied: vec![EntityId::from("E1")],
            conflicts: Vec::new(),
            server_changes: Vec::new(),
            synced_at: ts(20),
        }));
        let controller = controller(transport.clone()).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let outcome = controller.run_cycle().await.unwrap();

        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle, got {outcome:?}");
        };
        assert_eq!(report.pushed, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.cursor, Some(ts(20)));

        let requests = transport.push_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].last_synced_at, None);
        assert_eq!(requests[0].changes[0].action, ChangeAction::Create);

        let stored = controller
            .database()
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
        assert_eq!(stored.meta.server_updated_at, Some(ts(20)));
        assert!(controller.database().queue_entries().await.unwrap().is_empty());
        assert_eq!(controller.database().cursor().await.unwrap(), Some(ts(20)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_queue_with_fresh_pull_skips_network() {
        let transport = ScriptedTransport::default();
        let controller = controller(transport.clone()).await;

        // First cycle pulls because no cursor exists yet
        assert!(matches!(
            controller.request(SyncTrigger::Timer).await.unwrap(),
            CycleOutcome::Completed(_)
        ));
        assert_eq!(
            controller.request(SyncTrigger::Timer).await.unwrap(),
            CycleOutcome::Skipped
        );
        assert_eq!(transport.push_requests().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transport_failure_reverts_batch_and_backs_off() {
        let transport = ScriptedTransport::default();
        transport.respond(Err(SyncError::Transport("connection reset".to_string())));
        let controller = controller(transport.clone()).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let error = controller.run_cycle().await.unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Pending);
        assert_eq!(controller.database().queue_entries().await.unwrap().len(), 1);
        assert_eq!(controller.database().cursor().await.unwrap(), None);

        assert!(matches!(
            controller.request(SyncTrigger::Retry).await.unwrap(),
            CycleOutcome::BackingOff { .. }
        ));
        // A manual request ignores the backoff window
        assert!(matches!(
            controller.run_cycle().await.unwrap(),
            CycleOutcome::Completed(_)
        ));
        assert_eq!(controller.retry_in(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_response_is_rejected_before_any_write() {
        let transport = ScriptedTransport::default();
        transport.respond(Ok(PushResponse {
            applied: vec![EntityId::from("E1")],
            conflicts: Vec::new(),
            server_changes: vec![SyncChange {
                entity_type: EntityType::Expense,
                entity_id: EntityId::from("E2"),
                action: ChangeAction::Update,
                data: json!({"amount": "not a number"}),
                local_updated_at: ts(15),
            }],
            synced_at: ts(20),
        }));
        let controller = controller(transport).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let error = controller.run_cycle().await.unwrap_err();
        assert!(matches!(error, SyncError::Server { .. }));
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Pending);
        assert_eq!(controller.database().queue_entries().await.unwrap().len(), 1);
        assert_eq!(controller.database().cursor().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_keeps_queue_entry_and_local_value() {
        let transport = ScriptedTransport::default();
        let conflict = Conflict {
            entity_type: EntityType::Expense,
            entity_id: EntityId::from("E1"),
            local_data: expense("E1", 1200.0),
            server_data: Some(expense("E1", 900.0)),
            local_updated_at: ts(30),
            server_updated_at: ts(25),
        };
        transport.respond(Ok(PushResponse {
            applied: Vec::new(),
            conflicts: vec![WireConflict::from_conflict(&conflict).unwrap()],
            server_changes: Vec::new(),
            synced_at: ts(31),
        }));
        let controller = controller(transport.clone()).await;
        controller
            .database()
            .save(&expense("E1", 1200.0), ts(30))
            .await
            .unwrap();
        let before = controller.database().queue_entries().await.unwrap();

        controller.run_cycle().await.unwrap();

        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Conflict);
        assert_eq!(controller.database().queue_entries().await.unwrap(), before);
        assert_eq!(controller.database().conflicts().await.unwrap(), vec![conflict]);
        let stored = controller
            .database()
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record, expense("E1", 1200.0));
        assert_eq!(controller.database().cursor().await.unwrap(), Some(ts(31)));

        // Conflicted entries stay out of later pushes
        controller.run_cycle().await.unwrap();
        assert!(transport.push_requests()[1].changes.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsettled_entry_is_marked_error_and_retried() {
        let transport = ScriptedTransport::default();
        transport.respond(Ok(PushResponse {
            applied: Vec::new(),
            conflicts: Vec::new(),
            server_changes: Vec::new(),
            synced_at: ts(20),
        }));
        let controller = controller(transport.clone()).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let CycleOutcome::Completed(report) = controller.run_cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.errored, 1);
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Error);

        controller.run_cycle().await.unwrap();
        assert_eq!(transport.push_requests()[1].changes.len(), 1);
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_changes_apply_only_without_queued_edits() {
        let transport = ScriptedTransport::default();
        let mut remote_trip = Trip::new("Remote trip");
        remote_trip.created_at = ts(0);
        let remote_trip: EntityRecord = remote_trip.into();
        transport.respond(Ok(PushResponse {
            applied: Vec::new(),
            conflicts: Vec::new(),
            server_changes: vec![
                SyncChange::from_record(ChangeAction::Update, &expense("E1", 1.0), ts(15))
                    .unwrap(),
                SyncChange::from_record(ChangeAction::Create, &remote_trip, ts(16)).unwrap(),
            ],
            synced_at: ts(20),
        }));
        let controller = controller(transport).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let CycleOutcome::Completed(report) = controller.run_cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.server_changes_applied, 1);
        assert_eq!(report.server_changes_deferred, 1);

        let local = controller
            .database()
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.record, expense("E1", 1000.0));

        let pulled = controller
            .database()
            .get(EntityType::Trip, remote_trip.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulled.record, remote_trip);
        assert_eq!(pulled.meta, SyncMetadata::synced(ts(16)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_state_entity_ignores_server_change() {
        let transport = ScriptedTransport::default();
        transport.respond(Ok(PushResponse {
            applied: Vec::new(),
            conflicts: Vec::new(),
            server_changes: Vec::new(),
            synced_at: ts(20),
        }));
        transport.respond(Ok(PushResponse {
            applied: Vec::new(),
            conflicts: Vec::new(),
            server_changes: vec![SyncChange::from_record(
                ChangeAction::Update,
                &expense("E1", 5.0),
                ts(25),
            )
            .unwrap()],
            synced_at: ts(30),
        }));
        let controller = controller(transport).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        controller.run_cycle().await.unwrap();
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Error);
        controller.run_cycle().await.unwrap();

        let stored = controller
            .database()
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record, expense("E1", 1000.0));
        assert_eq!(controller.database().queue_entries().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn confirmed_delete_purges_row() {
        let transport = ScriptedTransport::default();
        let controller = controller(transport).await;
        let db = controller.database();
        db.save(&expense("E1", 1000.0), ts(10)).await.unwrap();
        controller.run_cycle().await.unwrap();

        db.delete(EntityType::Expense, &EntityId::from("E1"), ts(40_000))
            .await
            .unwrap();
        assert_eq!(
            db.queue_entries().await.unwrap()[0].action,
            ChangeAction::Delete
        );
        controller.run_cycle().await.unwrap();

        assert!(db
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .is_none());
        assert!(db.queue_entries().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_probe_touches_nothing() {
        let transport = ScriptedTransport::default();
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let controller = controller(transport.clone())
            .await
            .with_connectivity(monitor.clone());
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        assert_eq!(controller.run_cycle().await.unwrap(), CycleOutcome::Offline);
        assert!(transport.push_requests().is_empty());
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Pending);

        monitor.set_online(true);
        assert!(matches!(
            controller.request(SyncTrigger::Reconnected).await.unwrap(),
            CycleOutcome::Completed(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_credentials_halt_until_reauth() {
        let transport = ScriptedTransport::default();
        let credentials = StaticCredentials::new(None);
        let db = DatabaseService::open_in_memory().await.unwrap();
        let controller = SyncController::new(
            db,
            transport.clone(),
            Arc::new(credentials.clone()),
            &SyncSettings::with_base_url("http://localhost:8080"),
        );
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        assert!(matches!(
            controller.run_cycle().await,
            Err(SyncError::AuthExpired)
        ));
        credentials.set(Some("fresh".to_string()));
        assert!(matches!(
            controller.run_cycle().await,
            Err(SyncError::AuthExpired)
        ));
        assert!(controller.is_halted());
        assert_eq!(controller.database().queue_entries().await.unwrap().len(), 1);
        assert!(transport.push_requests().is_empty());

        controller.resume_after_reauth();
        assert!(matches!(
            controller.run_cycle().await.unwrap(),
            CycleOutcome::Completed(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_never_overlap() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(50));
        let controller = controller(transport.clone()).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let (first, second) = tokio::join!(controller.run_cycle(), controller.run_cycle());

        assert_eq!(second.unwrap(), CycleOutcome::Coalesced);
        assert!(matches!(first.unwrap(), CycleOutcome::Completed(_)));
        assert_eq!(transport.max_concurrent_pushes(), 1);
        // The coalesced request ran once after the first cycle
        assert_eq!(transport.push_requests().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cursor_never_decreases() {
        let transport = ScriptedTransport::default();
        for synced_at in [ts(50), ts(40)] {
            transport.respond(Ok(PushResponse {
                applied: Vec::new(),
                conflicts: Vec::new(),
                server_changes: Vec::new(),
                synced_at,
            }));
        }
        let controller = controller(transport).await;

        controller.run_cycle().await.unwrap();
        controller.run_cycle().await.unwrap();
        assert_eq!(controller.database().cursor().await.unwrap(), Some(ts(50)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandoned_cycle_releases_the_slot() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(200));
        let controller = controller(transport.clone()).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), controller.run_cycle()).await;
        assert!(abandoned.is_err());
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Syncing);

        let outcome = controller.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(_)), "got {outcome:?}");
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Synced);
        assert!(controller.database().queue_entries().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_rerun_still_reports_committed_cycle() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(50));
        transport.respond(Ok(PushResponse {
            applied: vec![EntityId::from("E1")],
            conflicts: Vec::new(),
            server_changes: Vec::new(),
            synced_at: ts(20),
        }));
        transport.respond(Err(SyncError::Transport("connection reset".to_string())));
        let controller = controller(transport.clone()).await;
        controller
            .database()
            .save(&expense("E1", 1000.0), ts(10))
            .await
            .unwrap();

        let (first, second) = tokio::join!(controller.run_cycle(), controller.run_cycle());

        assert_eq!(second.unwrap(), CycleOutcome::Coalesced);
        let CycleOutcome::Completed(report) = first.unwrap() else {
            panic!("expected the first cycle's report");
        };
        assert_eq!(report.applied, 1);
        assert_eq!(report.cursor, Some(ts(20)));
        assert_eq!(transport.push_requests().len(), 2);

        let overview = controller.overview().await.unwrap();
        assert_eq!(overview.consecutive_failures, 1);
        assert!(overview.retry_in.is_some());
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edit_during_push_stays_queued_for_next_cycle() {
        let transport = ScriptedTransport::default();
        let controller = controller(transport.clone()).await;
        let db = controller.database();
        db.save(&expense("E1", 1000.0), ts(10)).await.unwrap();
        transport.edit_during_next_request(db, MidFlightEdit::Save(expense("E1", 2000.0), ts(15)));

        let CycleOutcome::Completed(report) = controller.run_cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.applied, 1);
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Pending);
        let queued = db.queue_entries().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].local_updated_at, ts(15));
        let stored = db
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record, expense("E1", 2000.0));
        assert_eq!(stored.meta.server_updated_at, Some(ts(1_000)));

        controller.run_cycle().await.unwrap();
        let resent = &transport.push_requests()[1];
        assert_eq!(resent.changes.len(), 1);
        assert_eq!(resent.changes[0].local_updated_at, ts(15));
        assert_eq!(resent.changes[0].data["amount"], json!(2000.0));
        assert_eq!(status_of(&controller, "E1").await, SyncStatus::Synced);
        assert!(db.queue_entries().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_during_create_push_queues_a_server_delete() {
        let transport = ScriptedTransport::default();
        let controller = controller(transport.clone()).await;
        let db = controller.database();
        db.save(&expense("E1", 1000.0), ts(10)).await.unwrap();
        transport.edit_during_next_request(
            db,
            MidFlightEdit::Delete(EntityType::Expense, EntityId::from("E1"), ts(15)),
        );

        let CycleOutcome::Completed(report) = controller.run_cycle().await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.applied, 1);
        let queued = db.queue_entries().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, ChangeAction::Delete);
        let stored = db
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.meta.sync_status, SyncStatus::Pending);

        controller.run_cycle().await.unwrap();
        assert_eq!(
            transport.push_requests()[1].changes[0].action,
            ChangeAction::Delete
        );
        assert!(db
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .is_none());
        assert!(db.queue_entries().await.unwrap().is_empty());
    }
}
