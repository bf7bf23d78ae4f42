//! Wire protocol shared by the sync client and the backend.
//!
//! Payload `data` travels as plain JSON objects tagged by `entityType`; the
//! `validate`/`into_*` helpers turn them into typed records at the boundary so
//! a malformed response is rejected before any local state is touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::{ChangeAction, Conflict, EntityId, EntityRecord, EntityType, Resolution};

/// Key under which migrated objects carry their last local mutation time
pub const MIGRATION_TIMESTAMP_KEY: &str = "localUpdatedAt";

/// One queued mutation as sent to (or received from) the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub action: ChangeAction,
    #[serde(default)]
    pub data: Value,
    pub local_updated_at: DateTime<Utc>,
}

impl SyncChange {
    pub fn from_record(
        action: ChangeAction,
        record: &EntityRecord,
        local_updated_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            entity_type: record.entity_type(),
            entity_id: record.id().clone(),
            action,
            data: record.to_value()?,
            local_updated_at,
        })
    }

    /// Typed payload; deletes may arrive without one
    pub fn record(&self) -> Result<Option<EntityRecord>> {
        if self.action == ChangeAction::Delete && is_empty_payload(&self.data) {
            return Ok(None);
        }
        EntityRecord::from_value_for(self.entity_type, &self.entity_id, self.data.clone())
            .map(Some)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Vec<SyncChange>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    #[serde(default)]
    pub applied: Vec<EntityId>,
    #[serde(default)]
    pub conflicts: Vec<WireConflict>,
    #[serde(default)]
    pub server_changes: Vec<SyncChange>,
    pub synced_at: DateTime<Utc>,
}

impl PushResponse {
    /// Decode every payload up front; any malformed entry rejects the whole response
    pub fn validate(self) -> Result<PushResult> {
        let conflicts = self
            .conflicts
            .into_iter()
            .map(WireConflict::into_conflict)
            .collect::<Result<Vec<_>>>()?;

        let server_changes = self
            .server_changes
            .into_iter()
            .map(|change| {
                let record = change.record()?;
                Ok(ServerChange {
                    entity_type: change.entity_type,
                    entity_id: change.entity_id,
                    action: change.action,
                    record,
                    updated_at: change.local_updated_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PushResult {
            applied: self.applied,
            conflicts,
            server_changes,
            synced_at: self.synced_at,
        })
    }
}

/// A push response whose payloads all decoded cleanly
#[derive(Debug, Clone, PartialEq)]
pub struct PushResult {
    pub applied: Vec<EntityId>,
    pub conflicts: Vec<Conflict>,
    pub server_changes: Vec<ServerChange>,
    pub synced_at: DateTime<Utc>,
}

/// An entity changed server-side since the client's cursor
#[derive(Debug, Clone, PartialEq)]
pub struct ServerChange {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub action: ChangeAction,
    /// `None` only for deletes that carry no payload
    pub record: Option<EntityRecord>,
    /// When the server last changed the entity
    pub updated_at: DateTime<Utc>,
}

/// Conflict as it travels over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConflict {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub local_data: Value,
    #[serde(default)]
    pub server_data: Value,
    pub local_updated_at: DateTime<Utc>,
    pub server_updated_at: DateTime<Utc>,
}

impl WireConflict {
    pub fn from_conflict(conflict: &Conflict) -> Result<Self> {
        Ok(Self {
            entity_type: conflict.entity_type,
            entity_id: conflict.entity_id.clone(),
            local_data: conflict.local_data.to_value()?,
            server_data: conflict
                .server_data
                .as_ref()
                .map(EntityRecord::to_value)
                .transpose()?
                .unwrap_or(Value::Null),
            local_updated_at: conflict.local_updated_at,
            server_updated_at: conflict.server_updated_at,
        })
    }

    pub fn into_conflict(self) -> Result<Conflict> {
        let local_data = EntityRecord::from_value_for(
            self.entity_type,
            &self.entity_id,
            strip_migration_key(self.local_data),
        )?;
        let server_data = if is_empty_payload(&self.server_data) {
            None
        } else {
            Some(EntityRecord::from_value_for(
                self.entity_type,
                &self.entity_id,
                self.server_data,
            )?)
        };

        Ok(Conflict {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            local_data,
            server_data,
            local_updated_at: self.local_updated_at,
            server_updated_at: self.server_updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    #[serde(default)]
    pub ok: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrateRequest {
    #[serde(default)]
    pub trips: Vec<Value>,
    #[serde(default)]
    pub destinations: Vec<Value>,
    #[serde(default)]
    pub expenses: Vec<Value>,
}

impl MigrateRequest {
    /// Append one local entity, tagging it with its last local mutation time
    pub fn push_record(
        &mut self,
        record: &EntityRecord,
        local_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut value = record.to_value()?;
        if let (Some(timestamp), Some(object)) = (local_updated_at, value.as_object_mut()) {
            object.insert(
                MIGRATION_TIMESTAMP_KEY.to_string(),
                serde_json::to_value(timestamp)?,
            );
        }

        match record.entity_type() {
            EntityType::Trip => self.trips.push(value),
            EntityType::Destination => self.destinations.push(value),
            EntityType::Expense => self.expenses.push(value),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.trips.len() + self.destinations.len() + self.expenses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounts {
    #[serde(default)]
    pub trips: u64,
    #[serde(default)]
    pub destinations: u64,
    #[serde(default)]
    pub expenses: u64,
}

impl ImportCounts {
    pub const fn total(&self) -> u64 {
        self.trips + self.destinations + self.expenses
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateResponse {
    #[serde(default)]
    pub imported: ImportCounts,
    #[serde(default)]
    pub conflicts: Vec<WireConflict>,
    #[serde(default)]
    pub message: String,
}

/// Remove the migration timestamp so the object decodes as plain entity fields
pub fn strip_migration_key(mut value: Value) -> Value {
    if let Some(object) = value.as_object_mut() {
        object.remove(MIGRATION_TIMESTAMP_KEY);
    }
    value
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::{Expense, Trip};

    fn expense(id: &str, amount: f64) -> Expense {
        let mut expense = Expense::new(
            EntityId::from("D1"),
            amount,
            "KRW",
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        );
        expense.id = EntityId::from(id);
        expense
    }

    #[test]
    fn push_request_serializes_missing_cursor_as_null() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 2, 1, 0, 0).unwrap();
        let record = EntityRecord::from(expense("E1", 1000.0));
        let request = PushRequest {
            changes: vec![SyncChange::from_record(ChangeAction::Create, &record, t1).unwrap()],
            last_synced_at: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["lastSyncedAt"], Value::Null);
        assert_eq!(value["changes"][0]["entityType"], json!("expense"));
        assert_eq!(value["changes"][0]["action"], json!("create"));
        assert_eq!(value["changes"][0]["data"]["amount"], json!(1000.0));
        assert_eq!(
            value["changes"][0]["localUpdatedAt"],
            json!("2024-05-02T01:00:00Z")
        );
    }

    #[test]
    fn push_response_validation_decodes_conflicts() {
        let local = EntityRecord::from(expense("E1", 1200.0)).to_value().unwrap();
        let server = EntityRecord::from(expense("E1", 900.0)).to_value().unwrap();
        let response: PushResponse = serde_json::from_value(json!({
            "applied": [],
            "conflicts": [{
                "entityType": "expense",
                "entityId": "E1",
                "localData": local,
                "serverData": server,
                "localUpdatedAt": "2024-05-03T00:00:00Z",
                "serverUpdatedAt": "2024-05-02T12:00:00Z"
            }],
            "serverChanges": [],
            "syncedAt": "2024-05-03T00:00:01Z"
        }))
        .unwrap();

        let result = response.validate().unwrap();
        assert_eq!(result.conflicts.len(), 1);
        let Some(EntityRecord::Expense(server_expense)) = &result.conflicts[0].server_data else {
            panic!("expected server expense");
        };
        assert!((server_expense.amount - 900.0).abs() < f64::EPSILON);
    }

    #[test]
    fn push_response_validation_rejects_malformed_server_change() {
        let response: PushResponse = serde_json::from_value(json!({
            "serverChanges": [{
                "entityType": "trip",
                "entityId": "T1",
                "action": "update",
                "data": {"title": 42},
                "localUpdatedAt": "2024-05-03T00:00:00Z"
            }],
            "syncedAt": "2024-05-03T00:00:01Z"
        }))
        .unwrap();

        assert!(response.validate().is_err());
    }

    #[test]
    fn server_delete_without_payload_is_accepted() {
        let change: SyncChange = serde_json::from_value(json!({
            "entityType": "trip",
            "entityId": "T1",
            "action": "delete",
            "localUpdatedAt": "2024-05-03T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(change.record().unwrap(), None);
    }

    #[test]
    fn migrate_request_tags_objects_with_local_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 2, 1, 0, 0).unwrap();
        let mut request = MigrateRequest::default();
        request
            .push_record(&EntityRecord::from(Trip::new("Jeju")), Some(t1))
            .unwrap();
        request
            .push_record(&EntityRecord::from(expense("E1", 5.0)), None)
            .unwrap();

        assert_eq!(request.len(), 2);
        assert_eq!(request.trips[0][MIGRATION_TIMESTAMP_KEY], json!("2024-05-02T01:00:00Z"));
        assert!(request.expenses[0].get(MIGRATION_TIMESTAMP_KEY).is_none());

        let stripped = strip_migration_key(request.trips[0].clone());
        assert!(EntityRecord::from_value(EntityType::Trip, stripped).is_ok());
    }
}
