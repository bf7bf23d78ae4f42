use std::io;

use thiserror::Error;
use wayfare_core::sync::SyncError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] wayfare_core::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No entity JSON provided")]
    EmptyJson,
    #[error("Entity JSON must be an object")]
    NotAnObject,
    #[error("Entity ID cannot be empty")]
    EmptyEntityId,
    #[error("No open conflict for {0}")]
    ConflictNotFound(String),
    #[error(
        "Sync is not configured. Set WAYFARE_API_BASE_URL (and WAYFARE_ACCESS_TOKEN) in the environment or a .env file: {0}"
    )]
    SyncNotConfigured(String),
}

impl CliError {
    /// Extra line printed under the error, if any
    pub const fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Sync(SyncError::AuthExpired) => Some(
                "Hint: re-authenticate, export the new token as WAYFARE_ACCESS_TOKEN and run the command again.",
            ),
            Self::Sync(SyncError::CycleInFlight) => {
                Some("Hint: another sync is running; try again in a moment.")
            }
            _ => None,
        }
    }
}
