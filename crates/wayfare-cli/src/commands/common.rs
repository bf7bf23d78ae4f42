use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use wayfare_core::config::SyncSettings;
use wayfare_core::db::QueueEntry;
use wayfare_core::services::DatabaseService;
use wayfare_core::sync::{HttpSyncTransport, StaticCredentials, SyncController};
use wayfare_core::util::format_timestamp;
use wayfare_core::{Conflict, EntityId, EntityRecord, EntityType};

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct QueueItem {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub local_updated_at: String,
    pub queued_at: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub entity_type: String,
    pub entity_id: String,
    pub local_updated_at: String,
    pub server_updated_at: String,
    pub local_data: Value,
    /// `null` when the server deleted the entity
    pub server_data: Value,
}

pub fn queue_entry_to_item(entry: &QueueEntry) -> QueueItem {
    QueueItem {
        entity_type: entry.entity_type.to_string(),
        entity_id: entry.entity_id.to_string(),
        action: entry.action.to_string(),
        local_updated_at: format_timestamp(&entry.local_updated_at),
        queued_at: format_timestamp(&entry.created_at),
    }
}

pub fn conflict_to_item(conflict: &Conflict) -> Result<ConflictItem, CliError> {
    Ok(ConflictItem {
        entity_type: conflict.entity_type.to_string(),
        entity_id: conflict.entity_id.to_string(),
        local_updated_at: format_timestamp(&conflict.local_updated_at),
        server_updated_at: format_timestamp(&conflict.server_updated_at),
        local_data: conflict.local_data.to_value()?,
        server_data: conflict
            .server_data
            .as_ref()
            .map(EntityRecord::to_value)
            .transpose()?
            .unwrap_or(Value::Null),
    })
}

pub fn format_queue_lines(entries: &[QueueEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{:<7} {:<11} {}  {}",
                entry.action.to_string(),
                entry.entity_type.as_str(),
                entry.entity_id,
                format_sync_timestamp(&entry.local_updated_at)
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let server = if conflict.server_data.is_some() {
                "changed"
            } else {
                "deleted"
            };
            format!(
                "{} {} local={} server={} ({server} on server)",
                conflict.entity_type,
                conflict.entity_id,
                format_sync_timestamp(&conflict.local_updated_at),
                format_sync_timestamp(&conflict.server_updated_at),
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_optional_timestamp(timestamp: Option<&DateTime<Utc>>) -> String {
    timestamp.map_or_else(|| "never".to_string(), format_sync_timestamp)
}

/// Decode `--json` input into a typed record, filling in `id` and `createdAt` for new entities
pub fn parse_entity_json(
    entity_type: EntityType,
    raw: &str,
    now: DateTime<Utc>,
) -> Result<EntityRecord, CliError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CliError::EmptyJson);
    }

    let Value::Object(mut object) = serde_json::from_str::<Value>(raw)? else {
        return Err(CliError::NotAnObject);
    };
    fill_missing(&mut object, "id", || {
        Ok(Value::String(EntityId::new().to_string()))
    })?;
    fill_missing(&mut object, "createdAt", || Ok(serde_json::to_value(now)?))?;

    Ok(EntityRecord::from_value(entity_type, Value::Object(object))?)
}

fn fill_missing(
    object: &mut Map<String, Value>,
    key: &str,
    value: impl FnOnce() -> Result<Value, CliError>,
) -> Result<(), CliError> {
    if matches!(object.get(key), None | Some(Value::Null)) {
        object.insert(key.to_string(), value()?);
    }
    Ok(())
}

pub fn resolve_json_input(raw: &str) -> Result<String, CliError> {
    if raw.trim() == "-" {
        return read_piped_stdin()?.ok_or(CliError::EmptyJson);
    }
    Ok(raw.to_string())
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    if io::stdin().is_terminal() {
        return Ok(None);
    }

    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    let trimmed = input.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

pub fn normalize_entity_id(id: &str) -> Result<EntityId, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyEntityId);
    }
    Ok(EntityId::from(trimmed))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("WAYFARE_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wayfare")
        .join("wayfare.db")
}

pub async fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(path.to_path_buf()).await?)
}

/// Controller wired to the HTTP backend named in the environment
pub async fn open_sync_controller(
    path: &Path,
) -> Result<SyncController<HttpSyncTransport>, CliError> {
    let settings = SyncSettings::from_env()
        .map_err(|error| CliError::SyncNotConfigured(error.to_string()))?;
    tracing::debug!("Sync settings: {:?}", settings);

    let db = open_database(path).await?;
    let transport = HttpSyncTransport::new(&settings)?;
    let credentials = Arc::new(StaticCredentials::new(settings.access_token.clone()));
    Ok(SyncController::new(db, transport, credentials, &settings))
}
