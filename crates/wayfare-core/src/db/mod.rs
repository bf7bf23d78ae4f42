//! Database layer for Wayfare

mod connection;
mod conflict_repository;
mod entity_repository;
mod migrations;
mod queue_repository;
mod sync_state_repository;

pub use connection::{finish_transaction, Database};
pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository, PendingResolution};
pub use entity_repository::{EntityRepository, LibSqlEntityRepository};
pub use queue_repository::{LibSqlQueueRepository, QueueEntry, QueueRepository};
pub use sync_state_repository::{LibSqlSyncStateRepository, SyncStateRepository};
