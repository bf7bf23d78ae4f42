//! Offline-first sync engine.
//!
//! `SyncController` is the only component that talks to the sync endpoints.
//! Everything else (local edits, conflict resolution) only writes to the
//! local store and leaves delivery to the next cycle.

mod auth;
mod backoff;
mod connectivity;
mod controller;
mod driver;
mod error;
mod migration;
mod resolver;
#[cfg(test)]
mod testing;
mod transport;

pub use auth::{CredentialSource, StaticCredentials};
pub use backoff::Backoff;
pub use connectivity::{AlwaysOnline, Connectivity, ConnectivityMonitor};
pub use controller::{CycleOutcome, CycleReport, SyncController, SyncOverview, SyncTrigger};
pub use driver::run_sync_loop;
pub use error::{SyncError, SyncResult};
pub use migration::MigrationReport;
pub use resolver::ConflictResolver;
pub use transport::{HttpSyncTransport, SyncTransport};
