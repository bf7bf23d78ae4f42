//! Shared database service wrapper used across clients.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::db::{
    finish_transaction, ConflictRepository, Database, EntityRepository, LibSqlConflictRepository,
    LibSqlEntityRepository, LibSqlSyncStateRepository, QueueEntry, SyncStateRepository,
};
use crate::models::{ChangeAction, Conflict, EntityId, EntityRecord, EntityType, StoredEntity};
use crate::queue::{ChangeQueue, QueueWrite};
use crate::util::truncate_timestamp;
use crate::{Error, Result, SyncStatus};

/// Thread-safe service for the entity store and change queue.
///
/// The single mutex around the connection serialises compound writes; the
/// sync controller takes the same lock for its own transactions.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.db_path.as_deref()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    /// Save a local entity: a create when the id is new, an update otherwise.
    pub async fn save(&self, record: &EntityRecord, now: DateTime<Utc>) -> Result<QueueWrite> {
        let now = truncate_timestamp(now);
        let db = self.db.lock().await;
        let tx = db.begin().await?;
        let result = async {
            let existing = LibSqlEntityRepository::new(&tx)
                .get(record.entity_type(), record.id())
                .await?;
            let action = if existing.is_some() {
                ChangeAction::Update
            } else {
                ChangeAction::Create
            };
            ChangeQueue::new(&tx).enqueue(action, record, now).await
        }
        .await;
        finish_transaction(tx, result).await
    }

    /// Delete a local entity.
    pub async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        now: DateTime<Utc>,
    ) -> Result<QueueWrite> {
        let now = truncate_timestamp(now);
        let db = self.db.lock().await;
        let tx = db.begin().await?;
        let result = async {
            let existing = LibSqlEntityRepository::new(&tx)
                .get(entity_type, id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("{entity_type} {id}")))?;
            ChangeQueue::new(&tx)
                .enqueue(ChangeAction::Delete, &existing.record, now)
                .await
        }
        .await;
        finish_transaction(tx, result).await
    }

    /// Fetch an entity by id, including rows awaiting a confirmed delete.
    pub async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<StoredEntity>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .get(entity_type, id)
            .await
    }

    /// List live entities of one type.
    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<StoredEntity>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .list(entity_type, false)
            .await
    }

    /// Current queue entries in push order.
    pub async fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
        let db = self.db.lock().await;
        ChangeQueue::new(db.connection()).drain().await
    }

    /// Open conflicts.
    pub async fn conflicts(&self) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection()).list().await
    }

    /// Entity counts per sync status.
    pub async fn status_counts(&self) -> Result<Vec<(SyncStatus, u64)>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .status_counts()
            .await
    }

    /// The `lastSyncedAt` cursor.
    pub async fn cursor(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .cursor()
            .await
    }

    /// When the one-time migration import ran.
    pub async fn migrated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .migrated_at()
            .await
    }
}
