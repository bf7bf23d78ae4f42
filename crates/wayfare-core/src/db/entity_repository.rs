//! Entity store: trips, destinations and expenses with their sync metadata

use chrono::{DateTime, Utc};
use libsql::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::{
    Destination, EntityId, EntityRecord, EntityType, Expense, StoredEntity, SyncMetadata,
    SyncStatus, Trip,
};
use crate::util::{format_timestamp, parse_optional_date, parse_optional_timestamp, parse_timestamp};

const TRIP_COLUMNS: &str = "id, title, start_date, end_date, home_currency, budget, created_at, \
     sync_status, local_updated_at, server_updated_at, is_deleted";
const DESTINATION_COLUMNS: &str = "id, trip_id, name, country, currency, start_date, end_date, \
     created_at, sync_status, local_updated_at, server_updated_at, is_deleted";
const EXPENSE_COLUMNS: &str = "id, destination_id, amount, currency, amount_krw, exchange_rate, \
     category, memo, expense_date, created_at, sync_status, local_updated_at, \
     server_updated_at, is_deleted";

/// Trait for entity storage operations
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Insert or overwrite an entity row together with its sync metadata
    async fn upsert(&self, record: &EntityRecord, meta: &SyncMetadata, is_deleted: bool)
        -> Result<()>;

    /// Get an entity row by id, including soft-deleted rows
    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<StoredEntity>>;

    /// List rows of one type ordered by creation time
    async fn list(&self, entity_type: EntityType, include_deleted: bool)
        -> Result<Vec<StoredEntity>>;

    /// Set the sync status of one row; returns whether a row was touched
    async fn set_status(&self, entity_type: EntityType, id: &EntityId, status: SyncStatus)
        -> Result<bool>;

    /// Move every row in `from` to `to` across all entity tables
    async fn reset_status(&self, from: SyncStatus, to: SyncStatus) -> Result<u64>;

    /// Mark a row as matching server state at `server_updated_at`
    async fn mark_synced(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        server_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record the server timestamp without touching the status
    async fn set_server_updated_at(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        server_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Soft delete a row pending server confirmation
    async fn mark_deleted(&self, entity_type: EntityType, id: &EntityId, now: DateTime<Utc>)
        -> Result<bool>;

    /// Remove a row for good
    async fn purge(&self, entity_type: EntityType, id: &EntityId) -> Result<bool>;

    /// Number of rows per sync status across all entity tables
    async fn status_counts(&self) -> Result<Vec<(SyncStatus, u64)>>;
}

/// libSQL implementation of `EntityRepository`
pub struct LibSqlEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    const fn columns(entity_type: EntityType) -> &'static str {
        match entity_type {
            EntityType::Trip => TRIP_COLUMNS,
            EntityType::Destination => DESTINATION_COLUMNS,
            EntityType::Expense => EXPENSE_COLUMNS,
        }
    }

    async fn insert_trip(&self, trip: &Trip, sync: SyncColumns) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO trips (id, title, start_date, end_date, home_currency, budget,
                    created_at, sync_status, local_updated_at, server_updated_at, is_deleted)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    start_date = excluded.start_date,
                    end_date = excluded.end_date,
                    home_currency = excluded.home_currency,
                    budget = excluded.budget,
                    created_at = excluded.created_at,
                    sync_status = excluded.sync_status,
                    local_updated_at = excluded.local_updated_at,
                    server_updated_at = excluded.server_updated_at,
                    is_deleted = excluded.is_deleted",
                params![
                    trip.id.as_str(),
                    trip.title.as_str(),
                    format_date(trip.start_date),
                    format_date(trip.end_date),
                    trip.home_currency.as_str(),
                    trip.budget,
                    format_timestamp(&trip.created_at),
                    sync.status,
                    sync.local_updated_at,
                    sync.server_updated_at,
                    sync.is_deleted
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_destination(&self, destination: &Destination, sync: SyncColumns) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO destinations (id, trip_id, name, country, currency, start_date,
                    end_date, created_at, sync_status, local_updated_at, server_updated_at,
                    is_deleted)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    trip_id = excluded.trip_id,
                    name = excluded.name,
                    country = excluded.country,
                    currency = excluded.currency,
                    start_date = excluded.start_date,
                    end_date = excluded.end_date,
                    created_at = excluded.created_at,
                    sync_status = excluded.sync_status,
                    local_updated_at = excluded.local_updated_at,
                    server_updated_at = excluded.server_updated_at,
                    is_deleted = excluded.is_deleted",
                params![
                    destination.id.as_str(),
                    destination.trip_id.as_str(),
                    destination.name.as_str(),
                    destination.country.clone(),
                    destination.currency.as_str(),
                    format_date(destination.start_date),
                    format_date(destination.end_date),
                    format_timestamp(&destination.created_at),
                    sync.status,
                    sync.local_updated_at,
                    sync.server_updated_at,
                    sync.is_deleted
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_expense(&self, expense: &Expense, sync: SyncColumns) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO expenses (id, destination_id, amount, currency, amount_krw,
                    exchange_rate, category, memo, expense_date, created_at, sync_status,
                    local_updated_at, server_updated_at, is_deleted)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    destination_id = excluded.destination_id,
                    amount = excluded.amount,
                    currency = excluded.currency,
                    amount_krw = excluded.amount_krw,
                    exchange_rate = excluded.exchange_rate,
                    category = excluded.category,
                    memo = excluded.memo,
                    expense_date = excluded.expense_date,
                    created_at = excluded.created_at,
                    sync_status = excluded.sync_status,
                    local_updated_at = excluded.local_updated_at,
                    server_updated_at = excluded.server_updated_at,
                    is_deleted = excluded.is_deleted",
                params![
                    expense.id.as_str(),
                    expense.destination_id.as_str(),
                    expense.amount,
                    expense.currency.as_str(),
                    expense.amount_krw,
                    expense.exchange_rate,
                    expense.category.as_str(),
                    expense.memo.clone(),
                    expense.expense_date.format("%Y-%m-%d").to_string(),
                    format_timestamp(&expense.created_at),
                    sync.status,
                    sync.local_updated_at,
                    sync.server_updated_at,
                    sync.is_deleted
                ],
            )
            .await?;
        Ok(())
    }

    /// Parse a row selected with the column list of its entity type
    fn parse_row(entity_type: EntityType, row: &Row) -> Result<StoredEntity> {
        let (record, meta_offset) = match entity_type {
            EntityType::Trip => (EntityRecord::Trip(Self::parse_trip(row)?), 7),
            EntityType::Destination => (EntityRecord::Destination(Self::parse_destination(row)?), 8),
            EntityType::Expense => (EntityRecord::Expense(Self::parse_expense(row)?), 10),
        };

        let status: String = row.get(meta_offset)?;
        let meta = SyncMetadata {
            sync_status: status.parse()?,
            local_updated_at: parse_optional_timestamp(row.get(meta_offset + 1)?)?,
            server_updated_at: parse_optional_timestamp(row.get(meta_offset + 2)?)?,
        };

        Ok(StoredEntity {
            record,
            meta,
            is_deleted: row.get::<i64>(meta_offset + 3)? != 0,
        })
    }

    fn parse_trip(row: &Row) -> Result<Trip> {
        Ok(Trip {
            id: EntityId::from(row.get::<String>(0)?),
            title: row.get(1)?,
            start_date: parse_optional_date(row.get(2)?)?,
            end_date: parse_optional_date(row.get(3)?)?,
            home_currency: row.get(4)?,
            budget: row.get(5)?,
            created_at: parse_timestamp(&row.get::<String>(6)?)?,
        })
    }

    fn parse_destination(row: &Row) -> Result<Destination> {
        Ok(Destination {
            id: EntityId::from(row.get::<String>(0)?),
            trip_id: EntityId::from(row.get::<String>(1)?),
            name: row.get(2)?,
            country: row.get(3)?,
            currency: row.get(4)?,
            start_date: parse_optional_date(row.get(5)?)?,
            end_date: parse_optional_date(row.get(6)?)?,
            created_at: parse_timestamp(&row.get::<String>(7)?)?,
        })
    }

    fn parse_expense(row: &Row) -> Result<Expense> {
        let expense_date = parse_optional_date(Some(row.get::<String>(8)?))?
            .ok_or_else(|| Error::Database("expense row without expense_date".to_string()))?;
        let category: String = row.get(6)?;
        Ok(Expense {
            id: EntityId::from(row.get::<String>(0)?),
            destination_id: EntityId::from(row.get::<String>(1)?),
            amount: row.get(2)?,
            currency: row.get(3)?,
            amount_krw: row.get(4)?,
            exchange_rate: row.get(5)?,
            category: category.parse().unwrap_or_default(),
            memo: row.get(7)?,
            expense_date,
            created_at: parse_timestamp(&row.get::<String>(9)?)?,
        })
    }
}

/// Sync columns in their stored representation
struct SyncColumns {
    status: &'static str,
    local_updated_at: Option<String>,
    server_updated_at: Option<String>,
    is_deleted: i64,
}

impl SyncColumns {
    fn new(meta: &SyncMetadata, is_deleted: bool) -> Self {
        Self {
            status: meta.sync_status.as_str(),
            local_updated_at: meta.local_updated_at.as_ref().map(format_timestamp),
            server_updated_at: meta.server_updated_at.as_ref().map(format_timestamp),
            is_deleted: i64::from(is_deleted),
        }
    }
}

fn format_date(value: Option<chrono::NaiveDate>) -> Option<String> {
    value.map(|date| date.format("%Y-%m-%d").to_string())
}

impl EntityRepository for LibSqlEntityRepository<'_> {
    async fn upsert(
        &self,
        record: &EntityRecord,
        meta: &SyncMetadata,
        is_deleted: bool,
    ) -> Result<()> {
        let sync = SyncColumns::new(meta, is_deleted);
        match record {
            EntityRecord::Trip(trip) => self.insert_trip(trip, sync).await,
            EntityRecord::Destination(destination) => {
                self.insert_destination(destination, sync).await
            }
            EntityRecord::Expense(expense) => self.insert_expense(expense, sync).await,
        }
    }

    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<StoredEntity>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            Self::columns(entity_type),
            entity_type.table()
        );
        let mut rows = self.conn.query(&sql, params![id.as_str()]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_row(entity_type, &row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        entity_type: EntityType,
        include_deleted: bool,
    ) -> Result<Vec<StoredEntity>> {
        let filter = if include_deleted { "" } else { "WHERE is_deleted = 0" };
        let sql = format!(
            "SELECT {} FROM {} {filter} ORDER BY created_at, id",
            Self::columns(entity_type),
            entity_type.table()
        );
        let mut rows = self.conn.query(&sql, ()).await?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            entities.push(Self::parse_row(entity_type, &row)?);
        }
        Ok(entities)
    }

    async fn set_status(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        status: SyncStatus,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET sync_status = ? WHERE id = ?",
            entity_type.table()
        );
        let changed = self
            .conn
            .execute(&sql, params![status.as_str(), id.as_str()])
            .await?;
        Ok(changed > 0)
    }

    async fn reset_status(&self, from: SyncStatus, to: SyncStatus) -> Result<u64> {
        let mut total = 0;
        for entity_type in EntityType::ALL {
            let sql = format!(
                "UPDATE {} SET sync_status = ? WHERE sync_status = ?",
                entity_type.table()
            );
            total += self
                .conn
                .execute(&sql, params![to.as_str(), from.as_str()])
                .await?;
        }
        Ok(total)
    }

    async fn mark_synced(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        server_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET sync_status = ?, server_updated_at = ? WHERE id = ?",
            entity_type.table()
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![
                    SyncStatus::Synced.as_str(),
                    format_timestamp(&server_updated_at),
                    id.as_str()
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn set_server_updated_at(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        server_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET server_updated_at = ? WHERE id = ?",
            entity_type.table()
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![format_timestamp(&server_updated_at), id.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_deleted(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET is_deleted = 1, sync_status = ?, local_updated_at = ? WHERE id = ?",
            entity_type.table()
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![
                    SyncStatus::Pending.as_str(),
                    format_timestamp(&now),
                    id.as_str()
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn purge(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?", entity_type.table());
        let changed = self.conn.execute(&sql, params![id.as_str()]).await?;
        Ok(changed > 0)
    }

    async fn status_counts(&self) -> Result<Vec<(SyncStatus, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_status, COUNT(*) FROM (
                    SELECT sync_status FROM trips
                    UNION ALL SELECT sync_status FROM destinations
                    UNION ALL SELECT sync_status FROM expenses
                 ) GROUP BY sync_status ORDER BY sync_status",
                (),
            )
            .await?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count = u64::try_from(row.get::<i64>(1)?).unwrap_or_default();
            counts.push((status.parse()?, count));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Database;
    use crate::models::ExpenseCategory;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample_expense() -> Expense {
        let mut expense = Expense::new(
            EntityId::from("dest-1"),
            1000.0,
            "JPY",
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        );
        expense.id = EntityId::from("E1");
        expense.category = ExpenseCategory::Food;
        expense.memo = Some("ramen".to_string());
        expense.amount_krw = Some(9100.0);
        expense.exchange_rate = Some(9.1);
        expense.created_at = ts(0);
        expense
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_and_get_expense() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        let record = EntityRecord::from(sample_expense());

        repo.upsert(&record, &SyncMetadata::pending(ts(1)), false)
            .await
            .unwrap();

        let stored = repo
            .get(EntityType::Expense, &EntityId::from("E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record, record);
        assert_eq!(stored.meta, SyncMetadata::pending(ts(1)));
        assert!(!stored.is_deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_overwrites_fields() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        let mut trip = Trip::new("Osaka");
        trip.budget = Some(1_500_000.0);
        repo.upsert(&trip.clone().into(), &SyncMetadata::pending(ts(1)), false)
            .await
            .unwrap();

        trip.title = "Osaka & Kyoto".to_string();
        trip.start_date = NaiveDate::from_ymd_opt(2024, 5, 1);
        repo.upsert(&trip.clone().into(), &SyncMetadata::synced(ts(5)), false)
            .await
            .unwrap();

        let stored = repo.get(EntityType::Trip, &trip.id).await.unwrap().unwrap();
        assert_eq!(stored.record, EntityRecord::Trip(trip));
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
        assert_eq!(stored.meta.server_updated_at, Some(ts(5)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_transitions() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        let destination = Destination::new(EntityId::from("trip-1"), "Tokyo", "JPY");
        let id = destination.id.clone();
        repo.upsert(&destination.into(), &SyncMetadata::pending(ts(1)), false)
            .await
            .unwrap();

        assert!(repo
            .set_status(EntityType::Destination, &id, SyncStatus::Syncing)
            .await
            .unwrap());
        assert_eq!(
            repo.reset_status(SyncStatus::Syncing, SyncStatus::Pending)
                .await
                .unwrap(),
            1
        );
        assert!(repo
            .mark_synced(EntityType::Destination, &id, ts(9))
            .await
            .unwrap());

        let stored = repo
            .get(EntityType::Destination, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
        assert_eq!(stored.meta.local_updated_at, Some(ts(1)));
        assert_eq!(stored.meta.server_updated_at, Some(ts(9)));
        assert!(!repo
            .set_status(EntityType::Destination, &EntityId::from("missing"), SyncStatus::Error)
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_soft_delete_and_purge() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        let trip = Trip::new("Jeju");
        let id = trip.id.clone();
        repo.upsert(&trip.into(), &SyncMetadata::synced(ts(1)), false)
            .await
            .unwrap();

        repo.mark_deleted(EntityType::Trip, &id, ts(2)).await.unwrap();
        assert!(repo.list(EntityType::Trip, false).await.unwrap().is_empty());
        let all = repo.list(EntityType::Trip, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_deleted);
        assert_eq!(all[0].meta.sync_status, SyncStatus::Pending);

        assert!(repo.purge(EntityType::Trip, &id).await.unwrap());
        assert!(repo.get(EntityType::Trip, &id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_counts() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());
        repo.upsert(&Trip::new("A").into(), &SyncMetadata::pending(ts(1)), false)
            .await
            .unwrap();
        repo.upsert(&Trip::new("B").into(), &SyncMetadata::synced(ts(1)), false)
            .await
            .unwrap();
        repo.upsert(&sample_expense().into(), &SyncMetadata::pending(ts(1)), false)
            .await
            .unwrap();

        let counts = repo.status_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![(SyncStatus::Pending, 2), (SyncStatus::Synced, 1)]
        );
    }
}
