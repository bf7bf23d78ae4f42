//! Typed entity payloads shared by the store, the queue, and the wire protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Destination, EntityId, Expense, Trip};
use crate::error::{Error, Result};

/// The kind of a synchronizable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Trip,
    Destination,
    Expense,
}

impl EntityType {
    pub const ALL: [Self; 3] = [Self::Trip, Self::Destination, Self::Expense];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trip => "trip",
            Self::Destination => "destination",
            Self::Expense => "expense",
        }
    }

    /// Backing table in the local database
    pub(crate) const fn table(self) -> &'static str {
        match self {
            Self::Trip => "trips",
            Self::Destination => "destinations",
            Self::Expense => "expenses",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trip" => Ok(Self::Trip),
            "destination" => Ok(Self::Destination),
            "expense" => Ok(Self::Expense),
            other => Err(Error::InvalidInput(format!("unknown entity type: {other}"))),
        }
    }
}

/// Entity fields of one trip, destination or expense.
///
/// The wire protocol carries `data` as a plain JSON object next to an
/// `entityType` tag; this union is what the rest of the crate works with.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRecord {
    Trip(Trip),
    Destination(Destination),
    Expense(Expense),
}

impl EntityRecord {
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Trip(_) => EntityType::Trip,
            Self::Destination(_) => EntityType::Destination,
            Self::Expense(_) => EntityType::Expense,
        }
    }

    pub const fn id(&self) -> &EntityId {
        match self {
            Self::Trip(trip) => &trip.id,
            Self::Destination(destination) => &destination.id,
            Self::Expense(expense) => &expense.id,
        }
    }

    /// Encode the fields as the untyped `data` object used on the wire and in the queue
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Trip(trip) => serde_json::to_value(trip)?,
            Self::Destination(destination) => serde_json::to_value(destination)?,
            Self::Expense(expense) => serde_json::to_value(expense)?,
        };
        Ok(value)
    }

    /// Decode a `data` object according to its `entityType` tag
    pub fn from_value(entity_type: EntityType, value: Value) -> Result<Self> {
        let record = match entity_type {
            EntityType::Trip => Self::Trip(serde_json::from_value(value)?),
            EntityType::Destination => Self::Destination(serde_json::from_value(value)?),
            EntityType::Expense => Self::Expense(serde_json::from_value(value)?),
        };
        Ok(record)
    }

    /// Decode and check that the payload's own id matches the id it was filed under
    pub fn from_value_for(entity_type: EntityType, entity_id: &EntityId, value: Value) -> Result<Self> {
        let record = Self::from_value(entity_type, value)?;
        if record.id() != entity_id {
            return Err(Error::InvalidInput(format!(
                "{entity_type} payload id {} does not match entity id {entity_id}",
                record.id()
            )));
        }
        Ok(record)
    }
}

impl From<Trip> for EntityRecord {
    fn from(value: Trip) -> Self {
        Self::Trip(value)
    }
}

impl From<Destination> for EntityRecord {
    fn from(value: Destination) -> Self {
        Self::Destination(value)
    }
}

impl From<Expense> for EntityRecord {
    fn from(value: Expense) -> Self {
        Self::Expense(value)
    }
}
