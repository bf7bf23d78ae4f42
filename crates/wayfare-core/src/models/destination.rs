//! Destination model

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::EntityId;

/// A stop within a trip; expenses hang off destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub id: EntityId,
    /// Owning trip
    pub trip_id: EntityId,
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
    /// Local currency spent at this destination
    pub currency: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Destination {
    #[must_use]
    pub fn new(trip_id: EntityId, name: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            trip_id,
            name: name.into(),
            country: None,
            currency: currency.into(),
            start_date: None,
            end_date: None,
            created_at: crate::util::now(),
        }
    }
}
