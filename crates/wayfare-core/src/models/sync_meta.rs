//! Sync metadata carried by every stored entity row

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EntityRecord;
use crate::error::Error;

/// Where an entity stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Matches the last known server state
    Synced,
    /// Has a local mutation waiting in the change queue
    Pending,
    /// Picked up by an in-flight sync cycle
    Syncing,
    /// Server state diverged; waits for an explicit resolution
    Conflict,
    /// The last push did not settle; retried by the next cycle
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub sync_status: SyncStatus,
    /// Time of the last local mutation
    pub local_updated_at: Option<DateTime<Utc>>,
    /// Time of the last known server state
    pub server_updated_at: Option<DateTime<Utc>>,
}

impl SyncMetadata {
    /// Metadata of a row that was just mutated locally
    pub const fn pending(local_updated_at: DateTime<Utc>) -> Self {
        Self {
            sync_status: SyncStatus::Pending,
            local_updated_at: Some(local_updated_at),
            server_updated_at: None,
        }
    }

    /// Metadata of a row that mirrors server state
    pub const fn synced(server_updated_at: DateTime<Utc>) -> Self {
        Self {
            sync_status: SyncStatus::Synced,
            local_updated_at: None,
            server_updated_at: Some(server_updated_at),
        }
    }
}

/// An entity row as held by the local entity store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub record: EntityRecord,
    pub meta: SyncMetadata,
    /// Deleted locally, waiting for the server to confirm
    pub is_deleted: bool,
}
