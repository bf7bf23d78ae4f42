//! wayfare-core - Core library for Wayfare
//!
//! This crate contains the entity models, the libSQL-backed entity store and
//! change queue, and the offline-first sync engine (cycle controller, conflict
//! resolver, migration importer) shared by the CLI and any other client shell.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{
    Conflict, Destination, EntityId, EntityRecord, EntityType, Expense, Resolution, SyncStatus,
    Trip,
};
