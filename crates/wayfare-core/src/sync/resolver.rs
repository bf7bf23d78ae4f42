//! Conflict resolution.
//!
//! Resolving is purely local and atomic. The server is told about the choice
//! by the next sync cycle, which delivers pending acknowledgements before it
//! pushes.

use chrono::{DateTime, Utc};

use crate::db::{
    finish_transaction, ConflictRepository, EntityRepository, LibSqlConflictRepository,
    LibSqlEntityRepository, LibSqlQueueRepository, QueueRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    ChangeAction, Conflict, EntityId, EntityType, Resolution, SyncMetadata, SyncStatus,
};
use crate::services::DatabaseService;
use crate::util::truncate_timestamp;

#[derive(Clone)]
pub struct ConflictResolver {
    db: DatabaseService,
}

impl ConflictResolver {
    pub const fn new(db: DatabaseService) -> Self {
        Self { db }
    }

    /// Open conflicts, oldest first
    pub async fn list(&self) -> Result<Vec<Conflict>> {
        self.db.conflicts().await
    }

    pub async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .get(entity_type, id)
            .await
    }

    /// Settle one conflict.
    ///
    /// `KeepLocal` re-stamps the queued change so the server sees it as newer.
    /// `KeepServer` replaces the local row with the server's data (or removes it
    /// when the server deleted the entity) and drops the queued change.
    pub async fn resolve(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = truncate_timestamp(now);
        let db = self.db.lock().await;
        let tx = db.begin().await?;
        let result = async {
            let conflicts = LibSqlConflictRepository::new(&tx);
            let entities = LibSqlEntityRepository::new(&tx);
            let queue = LibSqlQueueRepository::new(&tx);

            let conflict = conflicts
                .get(entity_type, id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conflict for {entity_type} {id}")))?;

            match resolution {
                Resolution::KeepLocal => {
                    if !queue.touch(entity_type, id, now).await? {
                        queue
                            .insert(ChangeAction::Update, &conflict.local_data, now, now)
                            .await?;
                    }
                    entities.set_status(entity_type, id, SyncStatus::Pending).await?;
                }
                Resolution::KeepServer => {
                    match &conflict.server_data {
                        Some(record) => {
                            let meta = SyncMetadata::synced(conflict.server_updated_at);
                            entities.upsert(record, &meta, false).await?;
                        }
                        None => {
                            entities.purge(entity_type, id).await?;
                        }
                    }
                    queue.remove(entity_type, id).await?;
                }
            }

            conflicts.remove(entity_type, id).await?;
            conflicts
                .record_resolution(entity_type, id, resolution, now)
                .await?;
            Ok::<_, Error>(())
        }
        .await;
        finish_transaction(tx, result).await?;

        tracing::info!("Resolved conflict for {} {} as {}", entity_type, id, resolution);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::{EntityRecord, Expense};
    use crate::sync::testing::ts;

    fn expense(amount: f64) -> EntityRecord {
        let mut expense = Expense::new(
            EntityId::from("D1"),
            amount,
            "KRW",
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        );
        expense.id = EntityId::from("E1");
        expense.created_at = ts(0);
        expense.into()
    }

    /// E1 edited locally to 1200 while the server holds 900
    async fn conflicted_store() -> DatabaseService {
        let db = DatabaseService::open_in_memory().await.unwrap();
        db.save(&expense(1200.0), ts(30)).await.unwrap();
        {
            let guard = db.lock().await;
            let conn = guard.connection();
            LibSqlConflictRepository::new(conn)
                .upsert(
                    &Conflict {
                        entity_type: EntityType::Expense,
                        entity_id: EntityId::from("E1"),
                        local_data: expense(1200.0),
                        server_data: Some(expense(900.0)),
                        local_updated_at: ts(30),
                        server_updated_at: ts(25),
                    },
                    ts(31),
                )
                .await
                .unwrap();
            LibSqlEntityRepository::new(conn)
                .set_status(EntityType::Expense, &EntityId::from("E1"), SyncStatus::Conflict)
                .await
                .unwrap();
        }
        db
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_server_restores_server_data_and_clears_queue() {
        let db = conflicted_store().await;
        let resolver = ConflictResolver::new(db.clone());

        resolver
            .resolve(EntityType::Expense, &EntityId::from("E1"), Resolution::KeepServer, ts(40))
            .await
            .unwrap();

        let stored = db
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record, expense(900.0));
        assert_eq!(stored.meta, SyncMetadata::synced(ts(25)));
        assert!(db.queue_entries().await.unwrap().is_empty());
        assert!(resolver.list().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_requeues_with_fresh_timestamp() {
        let db = conflicted_store().await;
        let resolver = ConflictResolver::new(db.clone());

        resolver
            .resolve(EntityType::Expense, &EntityId::from("E1"), Resolution::KeepLocal, ts(40))
            .await
            .unwrap();

        let stored = db
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record, expense(1200.0));
        assert_eq!(stored.meta.sync_status, SyncStatus::Pending);

        let queue = db.queue_entries().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].local_updated_at, ts(40));
        assert_eq!(queue[0].record, expense(1200.0));
        assert!(resolver
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .is_none());

        let guard = db.lock().await;
        let pending = LibSqlConflictRepository::new(guard.connection())
            .pending_resolutions()
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].resolution, Resolution::KeepLocal);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_server_of_deleted_entity_removes_row() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        db.save(&expense(1200.0), ts(30)).await.unwrap();
        {
            let guard = db.lock().await;
            LibSqlConflictRepository::new(guard.connection())
                .upsert(
                    &Conflict {
                        entity_type: EntityType::Expense,
                        entity_id: EntityId::from("E1"),
                        local_data: expense(1200.0),
                        server_data: None,
                        local_updated_at: ts(30),
                        server_updated_at: ts(25),
                    },
                    ts(31),
                )
                .await
                .unwrap();
        }

        ConflictResolver::new(db.clone())
            .resolve(EntityType::Expense, &EntityId::from("E1"), Resolution::KeepServer, ts(40))
            .await
            .unwrap();

        assert!(db
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .is_none());
        assert!(db.queue_entries().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_without_conflict_is_not_found() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        db.save(&expense(1200.0), ts(30)).await.unwrap();

        let error = ConflictResolver::new(db.clone())
            .resolve(EntityType::Expense, &EntityId::from("E1"), Resolution::KeepLocal, ts(40))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
        assert_eq!(db.queue_entries().await.unwrap()[0].local_updated_at, ts(30));
    }
}
