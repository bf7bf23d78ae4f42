//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run one migration's statements inside a single transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so each statement runs separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            libsql::params![version],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: entity tables with sync metadata
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Parent references are plain columns: server changes may arrive in any order
        "CREATE TABLE IF NOT EXISTS trips (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            home_currency TEXT NOT NULL,
            budget REAL,
            created_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            local_updated_at TEXT,
            server_updated_at TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE TABLE IF NOT EXISTS destinations (
            id TEXT PRIMARY KEY,
            trip_id TEXT NOT NULL,
            name TEXT NOT NULL,
            country TEXT,
            currency TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            created_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            local_updated_at TEXT,
            server_updated_at TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_destinations_trip ON destinations(trip_id)",
        "CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            destination_id TEXT NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            amount_krw REAL,
            exchange_rate REAL,
            category TEXT NOT NULL,
            memo TEXT,
            expense_date TEXT NOT NULL,
            created_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            local_updated_at TEXT,
            server_updated_at TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_expenses_destination ON expenses(destination_id)",
        "CREATE INDEX IF NOT EXISTS idx_trips_status ON trips(sync_status)",
        "CREATE INDEX IF NOT EXISTS idx_destinations_status ON destinations(sync_status)",
        "CREATE INDEX IF NOT EXISTS idx_expenses_status ON expenses(sync_status)",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: change queue and sync state
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        // One entry per entity regardless of action
        "CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            data TEXT NOT NULL,
            local_updated_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(entity_type, entity_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at, id)",
        "CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    ];

    apply(conn, 2, &statements).await
}

/// Migration to version 3: open conflicts and pending resolution acknowledgements
async fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_data TEXT NOT NULL,
            server_data TEXT,
            local_updated_at TEXT NOT NULL,
            server_updated_at TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        )",
        "CREATE TABLE IF NOT EXISTS sync_resolutions (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            resolution TEXT NOT NULL,
            resolved_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        )",
    ];

    apply(conn, CURRENT_VERSION, &statements).await
}
