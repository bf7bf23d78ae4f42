//! Scripted in-process transport for sync tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use super::error::SyncResult;
use super::transport::SyncTransport;
use crate::models::{EntityId, EntityRecord, EntityType};
use crate::protocol::{
    Acknowledgement, MigrateRequest, MigrateResponse, PushRequest, PushResponse, ResolveRequest,
};
use crate::services::DatabaseService;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Local write the app makes while a request is on the wire
pub enum MidFlightEdit {
    Save(EntityRecord, DateTime<Utc>),
    Delete(EntityType, EntityId, DateTime<Utc>),
}

#[derive(Default)]
struct Script {
    pushes: VecDeque<SyncResult<PushResponse>>,
    migrations: VecDeque<SyncResult<MigrateResponse>>,
    push_requests: Vec<PushRequest>,
    resolve_requests: Vec<ResolveRequest>,
    migrate_requests: Vec<MigrateRequest>,
    edits: VecDeque<(DatabaseService, MidFlightEdit)>,
}

/// Replays queued responses; with nothing queued a push accepts every change
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// Every push and migrate takes `delay` before answering
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Apply `edit` to `db` inside the next push or migrate, before it answers
    pub fn edit_during_next_request(&self, db: &DatabaseService, edit: MidFlightEdit) {
        self.script
            .lock()
            .unwrap()
            .edits
            .push_back((db.clone(), edit));
    }

    async fn apply_mid_flight_edits(&self) {
        let edits: Vec<_> = self.script.lock().unwrap().edits.drain(..).collect();
        for (db, edit) in edits {
            match edit {
                MidFlightEdit::Save(record, at) => {
                    db.save(&record, at).await.unwrap();
                }
                MidFlightEdit::Delete(entity_type, id, at) => {
                    db.delete(entity_type, &id, at).await.unwrap();
                }
            }
        }
    }

    pub fn respond(&self, response: SyncResult<PushResponse>) {
        self.script.lock().unwrap().pushes.push_back(response);
    }

    pub fn respond_migrate(&self, response: SyncResult<MigrateResponse>) {
        self.script.lock().unwrap().migrations.push_back(response);
    }

    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.script.lock().unwrap().push_requests.clone()
    }

    pub fn resolve_requests(&self) -> Vec<ResolveRequest> {
        self.script.lock().unwrap().resolve_requests.clone()
    }

    pub fn migrate_requests(&self) -> Vec<MigrateRequest> {
        self.script.lock().unwrap().migrate_requests.clone()
    }

    /// Highest number of pushes observed in flight at once
    pub fn max_concurrent_pushes(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl SyncTransport for ScriptedTransport {
    async fn push(&self, _token: &str, request: &PushRequest) -> SyncResult<PushResponse> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.apply_mid_flight_edits().await;

        let mut script = self.script.lock().unwrap();
        script.push_requests.push(request.clone());
        let round = i64::try_from(script.push_requests.len()).unwrap();
        script.pushes.pop_front().unwrap_or_else(|| {
            Ok(PushResponse {
                applied: request
                    .changes
                    .iter()
                    .map(|change| change.entity_id.clone())
                    .collect(),
                conflicts: Vec::new(),
                server_changes: Vec::new(),
                synced_at: ts(1_000 * round),
            })
        })
    }

    async fn resolve(&self, _token: &str, request: &ResolveRequest) -> SyncResult<Acknowledgement> {
        self.script
            .lock()
            .unwrap()
            .resolve_requests
            .push(request.clone());
        Ok(Acknowledgement { ok: true })
    }

    async fn migrate(&self, _token: &str, request: &MigrateRequest) -> SyncResult<MigrateResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.apply_mid_flight_edits().await;

        let mut script = self.script.lock().unwrap();
        script.migrate_requests.push(request.clone());
        script.migrations.pop_front().unwrap_or_else(|| {
            Ok(MigrateResponse {
                imported: crate::protocol::ImportCounts {
                    trips: request.trips.len() as u64,
                    destinations: request.destinations.len() as u64,
                    expenses: request.expenses.len() as u64,
                },
                conflicts: Vec::new(),
                message: "imported".to_string(),
            })
        })
    }
}
