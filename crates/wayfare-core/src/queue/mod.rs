//! Change queue: the deduplicated ledger of pending local mutations.
//!
//! Every operation here runs on the connection (or transaction) it is given,
//! so a caller can combine a queue write with entity writes atomically.

mod collapse;

pub use collapse::{collapse, QueueWrite, QueuedChange};

use chrono::{DateTime, Utc};
use libsql::Connection;

use crate::db::{
    ConflictRepository, EntityRepository, LibSqlConflictRepository, LibSqlEntityRepository,
    LibSqlQueueRepository, QueueEntry, QueueRepository,
};
use crate::error::Result;
use crate::models::{ChangeAction, EntityId, EntityRecord, EntityType, SyncMetadata, SyncStatus};

/// Queue operations bound to one connection
pub struct ChangeQueue<'a> {
    conn: &'a Connection,
}

impl<'a> ChangeQueue<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record a local mutation.
    ///
    /// Collapses into the entity's existing entry and writes the entity row
    /// with status `pending` (or `conflict` while a conflict is open). Callers
    /// wanting both writes to be atomic run this inside a transaction.
    pub async fn enqueue(
        &self,
        action: ChangeAction,
        record: &EntityRecord,
        now: DateTime<Utc>,
    ) -> Result<QueueWrite> {
        let queue = LibSqlQueueRepository::new(self.conn);
        let entities = LibSqlEntityRepository::new(self.conn);
        let conflicts = LibSqlConflictRepository::new(self.conn);
        let entity_type = record.entity_type();
        let id = record.id();

        let existing = queue.get(entity_type, id).await?.map(|entry| QueuedChange {
            action: entry.action,
            local_updated_at: entry.local_updated_at,
        });
        let write = collapse(existing, action, now);

        let queued_action = match write {
            QueueWrite::Insert(action) => {
                queue.insert(action, record, now, now).await?;
                action
            }
            QueueWrite::Replace(action) => {
                queue.overwrite(action, record, now).await?;
                action
            }
            QueueWrite::Remove => {
                queue.remove(entity_type, id).await?;
                entities.purge(entity_type, id).await?;
                conflicts.remove(entity_type, id).await?;
                tracing::debug!("Dropped never-synced {} {}", entity_type, id);
                return Ok(write);
            }
            QueueWrite::Keep => {
                tracing::debug!("Newer delete of {} {} wins over {}", entity_type, id, action);
                return Ok(write);
            }
        };

        let status = if conflicts.get(entity_type, id).await?.is_some() {
            SyncStatus::Conflict
        } else {
            SyncStatus::Pending
        };

        if queued_action == ChangeAction::Delete {
            entities.mark_deleted(entity_type, id, now).await?;
            entities.set_status(entity_type, id, status).await?;
        } else {
            let server_updated_at = entities
                .get(entity_type, id)
                .await?
                .and_then(|stored| stored.meta.server_updated_at);
            let meta = SyncMetadata {
                sync_status: status,
                local_updated_at: Some(now),
                server_updated_at,
            };
            entities.upsert(record, &meta, false).await?;
        }

        Ok(write)
    }

    /// Snapshot of every entry in insertion order; nothing is removed
    pub async fn drain(&self) -> Result<Vec<QueueEntry>> {
        LibSqlQueueRepository::new(self.conn).list().await
    }

    pub async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<QueueEntry>> {
        LibSqlQueueRepository::new(self.conn).get(entity_type, id).await
    }

    pub async fn remove(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        LibSqlQueueRepository::new(self.conn)
            .remove(entity_type, id)
            .await
    }

    /// Remove an acknowledged entry unless a newer local edit overwrote it
    pub async fn remove_if_unchanged(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        local_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        LibSqlQueueRepository::new(self.conn)
            .remove_if_unchanged(entity_type, id, local_updated_at)
            .await
    }

    pub async fn len(&self) -> Result<u64> {
        LibSqlQueueRepository::new(self.conn).count().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
