//! One-time import of a device's offline dataset at account linking.
//!
//! Runs in the controller's single-flight slot, so it never overlaps a sync
//! cycle. After it succeeds the device only ever talks to the push endpoint.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::controller::SyncController;
use super::error::{SyncError, SyncResult};
use super::transport::SyncTransport;
use crate::db::{
    finish_transaction, ConflictRepository, EntityRepository, LibSqlConflictRepository,
    LibSqlEntityRepository, LibSqlQueueRepository, LibSqlSyncStateRepository, QueueRepository,
    SyncStateRepository,
};
use crate::models::{
    ChangeAction, Conflict, Destination, EntityId, EntityRecord, EntityType, Expense,
    SyncMetadata, SyncStatus, Trip,
};
use crate::protocol::{ImportCounts, MigrateRequest, WireConflict};
use crate::util::{compact_text, now};

/// Local state of one uploaded record at the moment the request was built
#[derive(Debug, Clone, Copy)]
struct UploadSnapshot {
    stored: bool,
    /// The stored row held exactly the uploaded value
    matches_upload: bool,
    queued_at: Option<DateTime<Utc>>,
}

type UploadSnapshots = HashMap<(EntityType, EntityId), UploadSnapshot>;

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub imported: ImportCounts,
    /// Entities the server already held in a different form; settle them with the resolver
    pub conflicts: Vec<Conflict>,
    pub message: String,
}

impl<T: SyncTransport> SyncController<T> {
    /// Upload every live local trip, destination and expense
    pub async fn import_local_dataset(&self) -> SyncResult<MigrationReport> {
        let mut trips = Vec::new();
        let mut destinations = Vec::new();
        let mut expenses = Vec::new();
        for entity_type in EntityType::ALL {
            for stored in self.database().list(entity_type).await? {
                match stored.record {
                    EntityRecord::Trip(trip) => trips.push(trip),
                    EntityRecord::Destination(destination) => destinations.push(destination),
                    EntityRecord::Expense(expense) => expenses.push(expense),
                }
            }
        }
        self.import_all(&trips, &destinations, &expenses).await
    }

    /// Send the whole dataset to the bulk-import endpoint and start regular sync from a fresh cursor
    pub async fn import_all(
        &self,
        trips: &[Trip],
        destinations: &[Destination],
        expenses: &[Expense],
    ) -> SyncResult<MigrationReport> {
        let records: Vec<EntityRecord> = trips
            .iter()
            .cloned()
            .map(EntityRecord::from)
            .chain(destinations.iter().cloned().map(EntityRecord::from))
            .chain(expenses.iter().cloned().map(EntityRecord::from))
            .collect();

        let slot = self.begin_exclusive()?;
        let result = self.run_import(&records).await;
        let rerun = self.end_exclusive(slot, matches!(result, Err(SyncError::AuthExpired)));

        match &result {
            Ok(report) => {
                tracing::info!(
                    "Migration imported {} entities with {} conflicts",
                    report.imported.total(),
                    report.conflicts.len()
                );
                if let Some(trigger) = rerun {
                    if let Err(error) = self.request(trigger).await {
                        tracing::warn!("Sync cycle after migration failed: {}", error);
                    }
                }
            }
            Err(error) => tracing::warn!("Migration import failed: {}", error),
        }
        result
    }

    async fn run_import(&self, records: &[EntityRecord]) -> SyncResult<MigrationReport> {
        if !self.connectivity().is_online() {
            return Err(SyncError::Transport("device is offline".to_string()));
        }
        let token = self
            .credentials()
            .access_token()
            .ok_or(SyncError::AuthExpired)?;

        let started_at = now();
        let (request, snapshots) = {
            let db = self.database().lock().await;
            let conn = db.connection();
            let sync_state = LibSqlSyncStateRepository::new(conn);
            if sync_state.cursor().await?.is_some() || sync_state.migrated_at().await?.is_some() {
                return Err(SyncError::MigrationAlreadyCompleted);
            }

            let entities = LibSqlEntityRepository::new(conn);
            let queue = LibSqlQueueRepository::new(conn);
            let mut request = MigrateRequest::default();
            let mut snapshots = UploadSnapshots::new();
            for record in records {
                let key = (record.entity_type(), record.id().clone());
                let stored = entities.get(key.0, &key.1).await?;
                let queued_at = queue
                    .get(key.0, &key.1)
                    .await?
                    .map(|entry| entry.local_updated_at);
                request.push_record(
                    record,
                    stored.as_ref().and_then(|stored| stored.meta.local_updated_at),
                )?;
                snapshots.insert(
                    key,
                    UploadSnapshot {
                        stored: stored.is_some(),
                        matches_upload: stored
                            .as_ref()
                            .is_some_and(|stored| &stored.record == record),
                        queued_at,
                    },
                );
            }
            (request, snapshots)
        };

        tracing::debug!("Uploading {} entities for migration", request.len());
        let response = self.transport().migrate(&token, &request).await?;
        let conflicts = response
            .conflicts
            .into_iter()
            .map(WireConflict::into_conflict)
            .collect::<crate::Result<Vec<_>>>()
            .map_err(|error| SyncError::Server {
                status: 200,
                message: compact_text(&format!("malformed migrate response: {error}")),
            })?;

        self.settle_import(records, &snapshots, &conflicts, started_at)
            .await?;

        Ok(MigrationReport {
            imported: response.imported,
            conflicts,
            message: response.message,
        })
    }

    /// Reconcile local rows with the import result in one transaction.
    ///
    /// Edits made while the request was on the wire are compared against the
    /// upload snapshot and stay queued; only what the server received is
    /// marked synced.
    async fn settle_import(
        &self,
        records: &[EntityRecord],
        snapshots: &UploadSnapshots,
        conflicts: &[Conflict],
        started_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let conflicted: HashSet<(EntityType, &EntityId)> = conflicts
            .iter()
            .map(|conflict| (conflict.entity_type, &conflict.entity_id))
            .collect();

        let db = self.database().lock().await;
        let tx = db.begin().await?;
        let result = async {
            let entities = LibSqlEntityRepository::new(&tx);
            let queue = LibSqlQueueRepository::new(&tx);
            let conflict_repo = LibSqlConflictRepository::new(&tx);
            let sync_state = LibSqlSyncStateRepository::new(&tx);
            let stamped = now();

            for conflict in conflicts {
                let stored = entities
                    .get(conflict.entity_type, &conflict.entity_id)
                    .await?;
                if stored.is_none() {
                    let meta = SyncMetadata::pending(conflict.local_updated_at);
                    entities.upsert(&conflict.local_data, &meta, false).await?;
                }
                if queue
                    .get(conflict.entity_type, &conflict.entity_id)
                    .await?
                    .is_none()
                {
                    queue
                        .insert(
                            ChangeAction::Update,
                            &conflict.local_data,
                            conflict.local_updated_at,
                            stamped,
                        )
                        .await?;
                }
                entities
                    .set_status(conflict.entity_type, &conflict.entity_id, SyncStatus::Conflict)
                    .await?;
                conflict_repo.upsert(conflict, stamped).await?;
            }

            for record in records {
                let (entity_type, id) = (record.entity_type(), record.id());
                if conflicted.contains(&(entity_type, id)) {
                    continue;
                }
                let snapshot = snapshots
                    .get(&(entity_type, id.clone()))
                    .copied()
                    .unwrap_or(UploadSnapshot {
                        stored: false,
                        matches_upload: false,
                        queued_at: None,
                    });

                match entities.get(entity_type, id).await? {
                    Some(stored) if stored.is_deleted => {}
                    Some(stored) => {
                        let unchanged = match (snapshot.matches_upload, snapshot.queued_at) {
                            (false, _) => false,
                            (true, Some(queued_at)) => {
                                queue
                                    .remove_if_unchanged(entity_type, id, queued_at)
                                    .await?
                            }
                            (true, None) => queue.get(entity_type, id).await?.is_none(),
                        };
                        if unchanged {
                            entities.mark_synced(entity_type, id, started_at).await?;
                        } else {
                            // The server got an older value; the local one goes out with the next push
                            if queue.get(entity_type, id).await?.is_none() {
                                let local_updated_at =
                                    stored.meta.local_updated_at.unwrap_or(stamped);
                                queue
                                    .insert(
                                        ChangeAction::Update,
                                        &stored.record,
                                        local_updated_at,
                                        stamped,
                                    )
                                    .await?;
                            }
                            entities
                                .set_server_updated_at(entity_type, id, started_at)
                                .await?;
                            entities
                                .set_status(entity_type, id, SyncStatus::Pending)
                                .await?;
                            tracing::debug!(
                                "Keeping {} {} queued: local value differs from the upload",
                                entity_type,
                                id
                            );
                        }
                    }
                    None if snapshot.stored => {
                        // Deleted locally during the upload: the server holds it now
                        let meta = SyncMetadata {
                            sync_status: SyncStatus::Pending,
                            local_updated_at: Some(stamped),
                            server_updated_at: Some(started_at),
                        };
                        entities.upsert(record, &meta, true).await?;
                        queue
                            .insert(ChangeAction::Delete, record, stamped, stamped)
                            .await?;
                    }
                    None => {
                        entities
                            .upsert(record, &SyncMetadata::synced(started_at), false)
                            .await?;
                    }
                }
            }

            sync_state.reset_cursor(started_at).await?;
            sync_state.set_migrated_at(stamped).await?;
            Ok::<_, crate::Error>(())
        }
        .await;
        finish_transaction(tx, result).await?;
        Ok(())
    }
}
