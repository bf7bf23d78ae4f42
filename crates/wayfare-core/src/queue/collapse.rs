//! Collapsing of repeated local mutations into one queue entry

use chrono::{DateTime, Utc};

use crate::models::ChangeAction;

/// What a new local mutation does to the entity's queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueWrite {
    /// No entry yet: insert one with this action
    Insert(ChangeAction),
    /// Overwrite the entry's action, data and `local_updated_at`
    Replace(ChangeAction),
    /// Drop the entry; the entity never reached the server
    Remove,
    /// The existing entry already wins
    Keep,
}

/// The part of an existing entry that collapsing looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedChange {
    pub action: ChangeAction,
    pub local_updated_at: DateTime<Utc>,
}

/// Fold an incoming mutation into the entity's existing entry
pub fn collapse(
    existing: Option<QueuedChange>,
    incoming: ChangeAction,
    incoming_at: DateTime<Utc>,
) -> QueueWrite {
    use ChangeAction::{Create, Delete, Update};

    let Some(existing) = existing else {
        return QueueWrite::Insert(incoming);
    };

    match (existing.action, incoming) {
        (Create, Create | Update) => QueueWrite::Replace(Create),
        (Create, Delete) => QueueWrite::Remove,
        (Update, Create | Update) => QueueWrite::Replace(Update),
        (Update, Delete) => QueueWrite::Replace(Delete),
        (Delete, action) if incoming_at > existing.local_updated_at => QueueWrite::Replace(action),
        (Delete, _) => QueueWrite::Keep,
    }
}
