//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityId, EntityRecord, EntityType};
use crate::error::Error;

/// Divergence between a queued local change and newer server state.
///
/// Exists only while the entity's queue entry exists; resolving it either
/// re-stamps that entry (keep local) or drops it (keep server).
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// What the client tried to push
    pub local_data: EntityRecord,
    /// Current server state; `None` when the server deleted the entity
    pub server_data: Option<EntityRecord>,
    pub local_updated_at: DateTime<Utc>,
    pub server_updated_at: DateTime<Utc>,
}

/// How a conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepServer,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepServer => "keep_server",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(Self::KeepLocal),
            "keep_server" | "server" => Ok(Self::KeepServer),
            other => Err(Error::InvalidInput(format!("unknown resolution: {other}"))),
        }
    }
}
