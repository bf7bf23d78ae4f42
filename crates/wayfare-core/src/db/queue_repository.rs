//! Change queue persistence

use chrono::{DateTime, Utc};
use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{ChangeAction, EntityId, EntityRecord, EntityType};
use crate::protocol::SyncChange;
use crate::util::{format_timestamp, parse_timestamp};

const QUEUE_COLUMNS: &str =
    "id, entity_type, entity_id, action, data, local_updated_at, created_at";

/// The single pending mutation of one entity
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub action: ChangeAction,
    /// Newest fields; deletes keep the last known fields of the entity
    pub record: EntityRecord,
    pub local_updated_at: DateTime<Utc>,
    /// Insertion time; survives overwrites so drain order stays stable
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Wire form of this entry for a push batch
    pub fn to_change(&self) -> Result<SyncChange> {
        SyncChange::from_record(self.action, &self.record, self.local_updated_at)
    }
}

/// Trait for change queue storage operations
#[allow(async_fn_in_trait)]
pub trait QueueRepository {
    /// Get the entry of one entity
    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<QueueEntry>>;

    /// Insert the first entry of an entity
    async fn insert(
        &self,
        action: ChangeAction,
        record: &EntityRecord,
        local_updated_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Overwrite action, data and `local_updated_at` of an existing entry
    async fn overwrite(
        &self,
        action: ChangeAction,
        record: &EntityRecord,
        local_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Re-stamp an entry's `local_updated_at`
    async fn touch(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        local_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete the entry of one entity
    async fn remove(&self, entity_type: EntityType, id: &EntityId) -> Result<bool>;

    /// Delete the entry only if it was not overwritten since `local_updated_at`
    async fn remove_if_unchanged(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        local_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// All entries in insertion order
    async fn list(&self) -> Result<Vec<QueueEntry>>;

    /// Number of entries
    async fn count(&self) -> Result<u64>;
}

/// libSQL implementation of `QueueRepository`
pub struct LibSqlQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &Row) -> Result<QueueEntry> {
        let entity_type: EntityType = row.get::<String>(1)?.parse()?;
        let entity_id = EntityId::from(row.get::<String>(2)?);
        let data: serde_json::Value = serde_json::from_str(&row.get::<String>(4)?)?;

        Ok(QueueEntry {
            id: row.get(0)?,
            record: EntityRecord::from_value_for(entity_type, &entity_id, data)?,
            entity_type,
            entity_id,
            action: row.get::<String>(3)?.parse()?,
            local_updated_at: parse_timestamp(&row.get::<String>(5)?)?,
            created_at: parse_timestamp(&row.get::<String>(6)?)?,
        })
    }
}

impl QueueRepository for LibSqlQueueRepository<'_> {
    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<QueueEntry>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE entity_type = ? AND entity_id = ?"
        );
        let mut rows = self
            .conn
            .query(&sql, params![entity_type.as_str(), id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert(
        &self,
        action: ChangeAction,
        record: &EntityRecord,
        local_updated_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let data = serde_json::to_string(&record.to_value()?)?;
        self.conn
            .execute(
                "INSERT INTO sync_queue
                    (entity_type, entity_id, action, data, local_updated_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    record.entity_type().as_str(),
                    record.id().as_str(),
                    action.as_str(),
                    data,
                    format_timestamp(&local_updated_at),
                    format_timestamp(&created_at)
                ],
            )
            .await?;
        Ok(())
    }

    async fn overwrite(
        &self,
        action: ChangeAction,
        record: &EntityRecord,
        local_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let data = serde_json::to_string(&record.to_value()?)?;
        let changed = self
            .conn
            .execute(
                "UPDATE sync_queue SET action = ?, data = ?, local_updated_at = ?
                 WHERE entity_type = ? AND entity_id = ?",
                params![
                    action.as_str(),
                    data,
                    format_timestamp(&local_updated_at),
                    record.entity_type().as_str(),
                    record.id().as_str()
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn touch(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        local_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_queue SET local_updated_at = ?
                 WHERE entity_type = ? AND entity_id = ?",
                params![
                    format_timestamp(&local_updated_at),
                    entity_type.as_str(),
                    id.as_str()
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn remove(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM sync_queue WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), id.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn remove_if_unchanged(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        local_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM sync_queue
                 WHERE entity_type = ? AND entity_id = ? AND local_updated_at = ?",
                params![
                    entity_type.as_str(),
                    id.as_str(),
                    format_timestamp(&local_updated_at)
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY created_at, id");
        let mut rows = self.conn.query(&sql, ()).await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }

    async fn count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM sync_queue", ())
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
