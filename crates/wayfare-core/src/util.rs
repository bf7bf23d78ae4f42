//! Shared utility functions used across multiple modules.

use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};

use crate::error::Result;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    truncate_timestamp(Utc::now())
}

/// Drop sub-millisecond precision so a value survives a round trip through storage unchanged.
pub fn truncate_timestamp(value: DateTime<Utc>) -> DateTime<Utc> {
    value.trunc_subsecs(3)
}

/// Render a timestamp the way it is persisted: RFC 3339, millisecond precision, `Z` suffix.
///
/// The fixed width keeps lexical and chronological order identical in SQL.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a persisted or wire timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value.trim())?.with_timezone(&Utc))
}

pub fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

pub fn parse_optional_date(value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .as_deref()
        .map(|raw| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d"))
        .transpose()
        .map_err(Into::into)
}
