//! In-memory per-account record log backing the sync endpoints.
//!
//! Every write is stamped by a strictly increasing server clock, so a
//! client's cursor (`syncedAt`) cleanly splits what it has seen from what it
//! has not.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use wayfare_core::models::{ChangeAction, EntityId, EntityRecord, EntityType};
use wayfare_core::protocol::{
    strip_migration_key, ImportCounts, MigrateRequest, MigrateResponse, PushRequest,
    PushResponse, ResolveRequest, SyncChange, WireConflict, MIGRATION_TIMESTAMP_KEY,
};
use wayfare_core::util::{now, truncate_timestamp};

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq)]
struct StoredRecord {
    data: Value,
    updated_at: DateTime<Utc>,
    deleted: bool,
}

#[derive(Debug, Default)]
struct AccountLog {
    records: BTreeMap<(EntityType, EntityId), StoredRecord>,
    resolutions: Vec<ResolveRequest>,
}

#[derive(Debug, Default)]
struct StoreState {
    accounts: HashMap<String, AccountLog>,
    last_tick: Option<DateTime<Utc>>,
}

impl StoreState {
    /// Next server timestamp; never repeats and never goes backwards
    fn tick(&mut self) -> DateTime<Utc> {
        let wall = truncate_timestamp(now());
        let next = match self.last_tick {
            Some(last) if wall <= last => last + Duration::milliseconds(1),
            _ => wall,
        };
        self.last_tick = Some(next);
        next
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreStats {
    pub accounts: usize,
    pub records: usize,
    pub resolutions: usize,
}

#[derive(Debug, Default)]
pub struct SyncStore {
    state: Mutex<StoreState>,
}

impl SyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.lock().await;
        StoreStats {
            accounts: state.accounts.len(),
            records: state
                .accounts
                .values()
                .map(|account| account.records.len())
                .sum(),
            resolutions: state
                .accounts
                .values()
                .map(|account| account.resolutions.len())
                .sum(),
        }
    }

    /// Apply a push batch.
    ///
    /// A change conflicts when the stored record was written after the
    /// change's `localUpdatedAt`; otherwise it is applied and stamped.
    pub async fn push(
        &self,
        account_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, AppError> {
        for change in &request.changes {
            change.record()?;
        }

        let mut state = self.state.lock().await;
        let mut applied = Vec::new();
        let mut conflicts = Vec::new();
        let mut covered = HashSet::new();

        for change in request.changes {
            let key = (change.entity_type, change.entity_id.clone());
            let existing = state
                .accounts
                .get(account_id)
                .and_then(|account| account.records.get(&key))
                .cloned();

            match existing {
                Some(stored) if stored.updated_at > change.local_updated_at => {
                    conflicts.push(WireConflict {
                        entity_type: change.entity_type,
                        entity_id: change.entity_id.clone(),
                        local_data: change.data,
                        server_data: if stored.deleted {
                            Value::Null
                        } else {
                            stored.data
                        },
                        local_updated_at: change.local_updated_at,
                        server_updated_at: stored.updated_at,
                    });
                }
                _ => {
                    let updated_at = state.tick();
                    let deleted = change.action == ChangeAction::Delete;
                    state
                        .accounts
                        .entry(account_id.to_string())
                        .or_default()
                        .records
                        .insert(
                            key.clone(),
                            StoredRecord {
                                data: change.data,
                                updated_at,
                                deleted,
                            },
                        );
                    applied.push(change.entity_id);
                }
            }
            covered.insert(key);
        }

        let synced_at = state.tick();
        let server_changes = state
            .accounts
            .get(account_id)
            .map(|account| changes_since(account, request.last_synced_at, &covered))
            .unwrap_or_default();

        Ok(PushResponse {
            applied,
            conflicts,
            server_changes,
            synced_at,
        })
    }

    pub async fn record_resolution(&self, account_id: &str, request: ResolveRequest) {
        let mut state = self.state.lock().await;
        state
            .accounts
            .entry(account_id.to_string())
            .or_default()
            .resolutions
            .push(request);
    }

    /// Bulk import; identical records are skipped, differing ones come back as conflicts
    pub async fn migrate(
        &self,
        account_id: &str,
        request: MigrateRequest,
    ) -> Result<MigrateResponse, AppError> {
        let mut incoming = Vec::with_capacity(request.len());
        for (entity_type, objects) in [
            (EntityType::Trip, request.trips),
            (EntityType::Destination, request.destinations),
            (EntityType::Expense, request.expenses),
        ] {
            for object in objects {
                incoming.push(decode_migrated(entity_type, object)?);
            }
        }

        let mut state = self.state.lock().await;
        let mut imported = ImportCounts::default();
        let mut conflicts = Vec::new();

        for migrated in incoming {
            let key = (migrated.entity_type, migrated.entity_id.clone());
            let existing = state
                .accounts
                .get(account_id)
                .and_then(|account| account.records.get(&key))
                .cloned();

            match existing {
                Some(stored) if !stored.deleted && stored.data == migrated.data => {}
                Some(stored) => {
                    let local_updated_at = match migrated.local_updated_at {
                        Some(value) => value,
                        None => state.tick(),
                    };
                    conflicts.push(WireConflict {
                        entity_type: migrated.entity_type,
                        entity_id: migrated.entity_id,
                        local_data: migrated.data,
                        server_data: if stored.deleted {
                            Value::Null
                        } else {
                            stored.data
                        },
                        local_updated_at,
                        server_updated_at: stored.updated_at,
                    });
                }
                None => {
                    let updated_at = state.tick();
                    state
                        .accounts
                        .entry(account_id.to_string())
                        .or_default()
                        .records
                        .insert(
                            key,
                            StoredRecord {
                                data: migrated.data,
                                updated_at,
                                deleted: false,
                            },
                        );
                    match migrated.entity_type {
                        EntityType::Trip => imported.trips += 1,
                        EntityType::Destination => imported.destinations += 1,
                        EntityType::Expense => imported.expenses += 1,
                    }
                }
            }
        }

        let message = format!(
            "Imported {} records ({} conflicts)",
            imported.total(),
            conflicts.len()
        );
        Ok(MigrateResponse {
            imported,
            conflicts,
            message,
        })
    }
}

struct MigratedObject {
    entity_type: EntityType,
    entity_id: EntityId,
    data: Value,
    local_updated_at: Option<DateTime<Utc>>,
}

fn decode_migrated(entity_type: EntityType, object: Value) -> Result<MigratedObject, AppError> {
    let local_updated_at = object
        .get(MIGRATION_TIMESTAMP_KEY)
        .cloned()
        .map(serde_json::from_value::<DateTime<Utc>>)
        .transpose()
        .map_err(|error| {
            AppError::bad_request(format!("invalid {MIGRATION_TIMESTAMP_KEY}: {error}"))
        })?;
    let data = strip_migration_key(object);
    let record = EntityRecord::from_value(entity_type, data.clone())?;

    Ok(MigratedObject {
        entity_type,
        entity_id: record.id().clone(),
        data,
        local_updated_at,
    })
}

fn changes_since(
    account: &AccountLog,
    cursor: Option<DateTime<Utc>>,
    covered: &HashSet<(EntityType, EntityId)>,
) -> Vec<SyncChange> {
    let mut changes: Vec<SyncChange> = account
        .records
        .iter()
        .filter(|(key, _)| !covered.contains(*key))
        .filter(|(_, stored)| match cursor {
            Some(cursor) => stored.updated_at > cursor,
            // A first pull only needs live records
            None => !stored.deleted,
        })
        .map(|((entity_type, entity_id), stored)| SyncChange {
            entity_type: *entity_type,
            entity_id: entity_id.clone(),
            action: if stored.deleted {
                ChangeAction::Delete
            } else {
                ChangeAction::Update
            },
            data: if stored.deleted {
                Value::Null
            } else {
                stored.data.clone()
            },
            local_updated_at: stored.updated_at,
        })
        .collect();
    changes.sort_by_key(|change| change.local_updated_at);
    changes
}
