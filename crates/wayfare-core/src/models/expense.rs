//! Expense model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::EntityId;
use crate::error::Error;

/// Spending category of an expense
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseCategory {
    Food,
    Transport,
    Accommodation,
    Shopping,
    Activity,
    #[default]
    #[serde(other)]
    Other,
}

impl ExpenseCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Food => "food",
            Self::Transport => "transport",
            Self::Accommodation => "accommodation",
            Self::Shopping => "shopping",
            Self::Activity => "activity",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ExpenseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpenseCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "food" => Ok(Self::Food),
            "transport" => Ok(Self::Transport),
            "accommodation" => Ok(Self::Accommodation),
            "shopping" => Ok(Self::Shopping),
            "activity" => Ok(Self::Activity),
            "other" => Ok(Self::Other),
            other => Err(Error::InvalidInput(format!(
                "unknown expense category: {other}"
            ))),
        }
    }
}

/// A single expense recorded at a destination.
///
/// `amount_krw` and `exchange_rate` are filled by the currency conversion
/// service before the expense is saved; sync treats them as opaque data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: EntityId,
    /// Owning destination
    pub destination_id: EntityId,
    pub amount: f64,
    pub currency: String,
    #[serde(rename = "amountKRW", default)]
    pub amount_krw: Option<f64>,
    #[serde(default)]
    pub exchange_rate: Option<f64>,
    #[serde(default)]
    pub category: ExpenseCategory,
    #[serde(default)]
    pub memo: Option<String>,
    pub expense_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Expense {
    #[must_use]
    pub fn new(
        destination_id: EntityId,
        amount: f64,
        currency: impl Into<String>,
        expense_date: NaiveDate,
    ) -> Self {
        Self {
            id: EntityId::new(),
            destination_id,
            amount,
            currency: currency.into(),
            amount_krw: None,
            exchange_rate: None,
            category: ExpenseCategory::Other,
            memo: None,
            expense_date,
            created_at: crate::util::now(),
        }
    }
}
