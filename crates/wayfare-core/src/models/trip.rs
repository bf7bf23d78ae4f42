//! Trip model

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::EntityId;

/// Default currency for a new trip's totals
pub const DEFAULT_HOME_CURRENCY: &str = "KRW";

/// A trip, the root of the ownership tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub home_currency: String,
    #[serde(default)]
    pub budget: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Trip {
    /// Create a new trip with a fresh id
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            title: title.into(),
            start_date: None,
            end_date: None,
            home_currency: DEFAULT_HOME_CURRENCY.to_string(),
            budget: None,
            created_at: crate::util::now(),
        }
    }

    /// Number of calendar days covered, when both ends are known
    #[must_use]
    pub fn duration_days(&self) -> Option<i64> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) if end >= start => Some((end - start).num_days() + 1),
            _ => None,
        }
    }
}
