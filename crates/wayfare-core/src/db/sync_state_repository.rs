//! Key/value sync checkpoints (cursor, migration marker)

use chrono::{DateTime, Utc};
use libsql::{params, Connection};

use crate::error::Result;
use crate::util::{format_timestamp, parse_timestamp};

const CURSOR_KEY: &str = "last_synced_at";
const MIGRATED_AT_KEY: &str = "migrated_at";

/// Trait for sync state storage operations
#[allow(async_fn_in_trait)]
pub trait SyncStateRepository {
    /// The `lastSyncedAt` cursor, if any cycle has completed
    async fn cursor(&self) -> Result<Option<DateTime<Utc>>>;

    /// Advance the cursor; an older value never replaces a newer one
    async fn advance_cursor(&self, synced_at: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Set the cursor unconditionally
    async fn reset_cursor(&self, value: DateTime<Utc>) -> Result<()>;

    /// When the one-time migration import completed
    async fn migrated_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Stamp the migration marker
    async fn set_migrated_at(&self, value: DateTime<Utc>) -> Result<()>;
}

/// libSQL implementation of `SyncStateRepository`
pub struct LibSqlSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_state WHERE key = ?", params![key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_timestamp(&row.get::<String>(0)?)?)),
            None => Ok(None),
        }
    }

    async fn set_timestamp(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_state (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, format_timestamp(&value)],
            )
            .await?;
        Ok(())
    }
}

impl SyncStateRepository for LibSqlSyncStateRepository<'_> {
    async fn cursor(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_timestamp(CURSOR_KEY).await
    }

    async fn advance_cursor(&self, synced_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = match self.cursor().await? {
            Some(current) if current >= synced_at => return Ok(current),
            _ => synced_at,
        };
        self.set_timestamp(CURSOR_KEY, next).await?;
        Ok(next)
    }

    async fn reset_cursor(&self, value: DateTime<Utc>) -> Result<()> {
        self.set_timestamp(CURSOR_KEY, value).await
    }

    async fn migrated_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_timestamp(MIGRATED_AT_KEY).await
    }

    async fn set_migrated_at(&self, value: DateTime<Utc>) -> Result<()> {
        self.set_timestamp(MIGRATED_AT_KEY, value).await
    }
}
