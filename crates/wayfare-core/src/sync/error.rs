//! Sync error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The request never produced a response (connect failure, timeout)
    #[error("Sync transport failed: {0}")]
    Transport(String),

    /// The server answered with a failure status or an undecodable body
    #[error("Sync server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The credential is missing or was rejected; sync stays halted until re-authentication
    #[error("Authentication expired; sign in again to resume sync")]
    AuthExpired,

    /// Local read/write failure; the cycle aborted without applying anything
    #[error("Local storage error: {0}")]
    Storage(#[from] crate::Error),

    /// Another cycle or the migration import is running
    #[error("A sync cycle is already in flight")]
    CycleInFlight,

    /// The one-time import already ran or a cursor already exists
    #[error("Migration import already completed for this device")]
    MigrationAlreadyCompleted,

    #[error("Invalid sync configuration: {0}")]
    InvalidConfiguration(String),
}

impl SyncError {
    /// Failures retried with backoff; the queue is left untouched
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server { .. })
    }
}

impl From<libsql::Error> for SyncError {
    fn from(error: libsql::Error) -> Self {
        Self::Storage(error.into())
    }
}

impl From<crate::config::ConfigError> for SyncError {
    fn from(error: crate::config::ConfigError) -> Self {
        Self::InvalidConfiguration(error.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
