//! Data models for Wayfare

mod change;
mod conflict;
mod destination;
mod entity_id;
mod expense;
mod record;
mod sync_meta;
mod trip;

pub use change::ChangeAction;
pub use conflict::{Conflict, Resolution};
pub use destination::Destination;
pub use entity_id::EntityId;
pub use expense::{Expense, ExpenseCategory};
pub use record::{EntityRecord, EntityType};
pub use sync_meta::{StoredEntity, SyncMetadata, SyncStatus};
pub use trip::Trip;
