//! Open conflicts and resolution acknowledgements awaiting delivery

use chrono::{DateTime, Utc};
use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{Conflict, EntityId, EntityRecord, EntityType, Resolution};
use crate::util::{format_timestamp, parse_timestamp};

const CONFLICT_COLUMNS: &str =
    "entity_type, entity_id, local_data, server_data, local_updated_at, server_updated_at";

/// A local resolution the server has not acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResolution {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub resolution: Resolution,
    pub resolved_at: DateTime<Utc>,
}

/// Trait for conflict storage operations
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    /// Store a conflict, replacing an older one for the same entity
    async fn upsert(&self, conflict: &Conflict, detected_at: DateTime<Utc>) -> Result<()>;

    /// Get the open conflict of one entity
    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<Conflict>>;

    /// All open conflicts, oldest first
    async fn list(&self) -> Result<Vec<Conflict>>;

    /// Clear the conflict of one entity
    async fn remove(&self, entity_type: EntityType, id: &EntityId) -> Result<bool>;

    /// Queue a resolution acknowledgement for the server
    async fn record_resolution(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        resolution: Resolution,
        resolved_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Resolution acknowledgements not yet delivered
    async fn pending_resolutions(&self) -> Result<Vec<PendingResolution>>;

    /// Drop a delivered acknowledgement
    async fn remove_resolution(&self, entity_type: EntityType, id: &EntityId) -> Result<bool>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row) -> Result<Conflict> {
        let entity_type: EntityType = row.get::<String>(0)?.parse()?;
        let entity_id = EntityId::from(row.get::<String>(1)?);
        let local_data = serde_json::from_str(&row.get::<String>(2)?)?;
        let server_data = match row.get::<Option<String>>(3)? {
            Some(raw) => Some(EntityRecord::from_value_for(
                entity_type,
                &entity_id,
                serde_json::from_str(&raw)?,
            )?),
            None => None,
        };

        Ok(Conflict {
            local_data: EntityRecord::from_value_for(entity_type, &entity_id, local_data)?,
            server_data,
            entity_type,
            entity_id,
            local_updated_at: parse_timestamp(&row.get::<String>(4)?)?,
            server_updated_at: parse_timestamp(&row.get::<String>(5)?)?,
        })
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn upsert(&self, conflict: &Conflict, detected_at: DateTime<Utc>) -> Result<()> {
        let local_data = serde_json::to_string(&conflict.local_data.to_value()?)?;
        let server_data = match &conflict.server_data {
            Some(record) => Some(serde_json::to_string(&record.to_value()?)?),
            None => None,
        };

        self.conn
            .execute(
                "INSERT INTO sync_conflicts (entity_type, entity_id, local_data, server_data,
                    local_updated_at, server_updated_at, detected_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                    local_data = excluded.local_data,
                    server_data = excluded.server_data,
                    local_updated_at = excluded.local_updated_at,
                    server_updated_at = excluded.server_updated_at,
                    detected_at = excluded.detected_at",
                params![
                    conflict.entity_type.as_str(),
                    conflict.entity_id.as_str(),
                    local_data,
                    server_data,
                    format_timestamp(&conflict.local_updated_at),
                    format_timestamp(&conflict.server_updated_at),
                    format_timestamp(&detected_at)
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE entity_type = ? AND entity_id = ?"
        );
        let mut rows = self
            .conn
            .query(&sql, params![entity_type.as_str(), id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts ORDER BY detected_at, entity_type, entity_id"
        );
        let mut rows = self.conn.query(&sql, ()).await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    async fn remove(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM sync_conflicts WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), id.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn record_resolution(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        resolution: Resolution,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_resolutions (entity_type, entity_id, resolution, resolved_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                    resolution = excluded.resolution,
                    resolved_at = excluded.resolved_at",
                params![
                    entity_type.as_str(),
                    id.as_str(),
                    resolution.as_str(),
                    format_timestamp(&resolved_at)
                ],
            )
            .await?;
        Ok(())
    }

    async fn pending_resolutions(&self) -> Result<Vec<PendingResolution>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, entity_id, resolution, resolved_at
                 FROM sync_resolutions ORDER BY resolved_at, entity_type, entity_id",
                (),
            )
            .await?;

        let mut pending = Vec::new();
        while let Some(row) = rows.next().await? {
            pending.push(PendingResolution {
                entity_type: row.get::<String>(0)?.parse()?,
                entity_id: EntityId::from(row.get::<String>(1)?),
                resolution: row.get::<String>(2)?.parse()?,
                resolved_at: parse_timestamp(&row.get::<String>(3)?)?,
            });
        }
        Ok(pending)
    }

    async fn remove_resolution(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM sync_resolutions WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), id.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }
}
