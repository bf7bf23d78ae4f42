use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use pretty_assertions::assert_eq;
use wayfare_core::db::{
    ConflictRepository, Database, EntityRepository, LibSqlConflictRepository,
    LibSqlEntityRepository,
};
use wayfare_core::models::ChangeAction;
use wayfare_core::queue::QueueWrite;
use wayfare_core::services::DatabaseService;
use wayfare_core::{Conflict, EntityId, EntityRecord, EntityType, Resolution, SyncStatus, Trip};

use crate::cli::{EntityKind, KeepSide};
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, format_queue_lines, format_sync_timestamp,
    normalize_entity_id, parse_entity_json, resolve_db_path,
};
use crate::commands::delete::run_delete;
use crate::commands::put::run_put;
use crate::commands::sync::{format_cycle_report, run_sync_resolve};
use crate::error::CliError;

fn test_db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("nested").join("wayfare.db")
}

fn trip(id: &str, title: &str) -> Trip {
    let mut trip = Trip::new(title);
    trip.id = EntityId::from(id);
    trip.created_at = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    trip
}

#[test]
fn parse_entity_json_fills_id_and_created_at() {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let record = parse_entity_json(
        EntityType::Trip,
        r#"{"title":"Osaka","homeCurrency":"KRW"}"#,
        now,
    )
    .unwrap();

    let EntityRecord::Trip(trip) = record else {
        panic!("expected a trip");
    };
    assert_eq!(trip.title, "Osaka");
    assert_eq!(trip.created_at, now);
    assert!(!trip.id.as_str().is_empty());
}

#[test]
fn parse_entity_json_keeps_explicit_id() {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let record = parse_entity_json(
        EntityType::Expense,
        r#"{"id":"E1","destinationId":"D1","amount":1200.5,"currency":"JPY","category":"food","expenseDate":"2024-05-02"}"#,
        now,
    )
    .unwrap();
    assert_eq!(record.id(), &EntityId::from("E1"));
}

#[test]
fn parse_entity_json_rejects_bad_input() {
    let now = Utc::now();
    assert!(matches!(
        parse_entity_json(EntityType::Trip, "  ", now),
        Err(CliError::EmptyJson)
    ));
    assert!(matches!(
        parse_entity_json(EntityType::Trip, "[1, 2]", now),
        Err(CliError::NotAnObject)
    ));
    // Missing required `title`
    assert!(parse_entity_json(EntityType::Trip, r#"{"homeCurrency":"KRW"}"#, now).is_err());
}

#[test]
fn normalize_entity_id_rejects_empty() {
    assert!(matches!(
        normalize_entity_id(" \n "),
        Err(CliError::EmptyEntityId)
    ));
    assert_eq!(normalize_entity_id("  T1  ").unwrap(), EntityId::from("T1"));
}

#[test]
fn explicit_db_path_wins() {
    let explicit = PathBuf::from("/tmp/explicit.db");
    assert_eq!(resolve_db_path(Some(explicit.clone())), explicit);
}

#[test]
fn value_enums_map_to_core_types() {
    assert_eq!(
        EntityType::from(EntityKind::Destination),
        EntityType::Destination
    );
    assert_eq!(Resolution::from(KeepSide::Local), Resolution::KeepLocal);
    assert_eq!(Resolution::from(KeepSide::Server), Resolution::KeepServer);
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    let timestamp = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(format_sync_timestamp(&timestamp), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_conflict_lines_flag_server_deletes() {
    let conflict = Conflict {
        entity_type: EntityType::Trip,
        entity_id: EntityId::from("T1"),
        local_data: trip("T1", "Osaka").into(),
        server_data: None,
        local_updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        server_updated_at: Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
    };

    let rendered = format_conflict_lines(std::slice::from_ref(&conflict));
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].starts_with("trip T1"));
    assert!(rendered[0].contains("deleted on server"));

    let item = conflict_to_item(&conflict).unwrap();
    assert_eq!(item.server_data, serde_json::Value::Null);
    assert_eq!(item.local_data["title"], "Osaka");
}

#[test]
fn cycle_report_mentions_conflicts() {
    let report = wayfare_core::sync::CycleReport {
        pushed: 3,
        applied: 2,
        conflicts: 1,
        ..Default::default()
    };
    let lines = format_cycle_report(&report);
    assert!(lines[0].contains("pushed 3"));
    assert!(lines.iter().any(|line| line.contains("wayfare sync conflicts")));
}

#[tokio::test(flavor = "multi_thread")]
async fn put_then_delete_collapses_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = test_db_path(&dir);

    run_put(
        EntityType::Trip,
        r#"{"id":"T1","title":"Osaka","homeCurrency":"KRW"}"#,
        &db_path,
    )
    .await
    .unwrap();

    {
        let db = DatabaseService::open_path(db_path.clone()).await.unwrap();
        let entries = db.queue_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ChangeAction::Create);
        assert!(format_queue_lines(&entries)[0].contains("T1"));
    }

    run_delete(EntityType::Trip, "T1", &db_path).await.unwrap();

    let db = DatabaseService::open_path(db_path.clone()).await.unwrap();
    assert!(db.queue_entries().await.unwrap().is_empty());
    assert!(db
        .get(EntityType::Trip, &EntityId::from("T1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_of_unknown_entity_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = run_delete(EntityType::Expense, "missing", &test_db_path(&dir))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CliError::Core(wayfare_core::Error::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_keep_server_replaces_local_row() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = test_db_path(&dir);
    let local_time = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let server_time = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();

    {
        let db = DatabaseService::open_path(db_path.clone()).await.unwrap();
        let write = db
            .save(&trip("T1", "Osaka local").into(), local_time)
            .await
            .unwrap();
        assert_eq!(write, QueueWrite::Insert(ChangeAction::Create));
    }
    {
        let db = Database::open(&db_path).await.unwrap();
        let mut server = trip("T1", "Osaka server");
        server.start_date = NaiveDate::from_ymd_opt(2024, 6, 1);
        LibSqlConflictRepository::new(db.connection())
            .upsert(
                &Conflict {
                    entity_type: EntityType::Trip,
                    entity_id: EntityId::from("T1"),
                    local_data: trip("T1", "Osaka local").into(),
                    server_data: Some(server.into()),
                    local_updated_at: local_time,
                    server_updated_at: server_time,
                },
                server_time,
            )
            .await
            .unwrap();
        LibSqlEntityRepository::new(db.connection())
            .set_status(EntityType::Trip, &EntityId::from("T1"), SyncStatus::Conflict)
            .await
            .unwrap();
    }

    let missing = run_sync_resolve(EntityType::Trip, "T2", Resolution::KeepServer, &db_path)
        .await
        .unwrap_err();
    assert!(matches!(missing, CliError::ConflictNotFound(_)));

    run_sync_resolve(EntityType::Trip, "T1", Resolution::KeepServer, &db_path)
        .await
        .unwrap();

    let db = DatabaseService::open_path(db_path.clone()).await.unwrap();
    let stored = db
        .get(EntityType::Trip, &EntityId::from("T1"))
        .await
        .unwrap()
        .unwrap();
    let EntityRecord::Trip(trip) = stored.record else {
        panic!("expected a trip");
    };
    assert_eq!(trip.title, "Osaka server");
    assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
    assert!(db.queue_entries().await.unwrap().is_empty());
    assert!(db.conflicts().await.unwrap().is_empty());
}
