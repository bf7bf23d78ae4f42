//! Client sync configuration.
//!
//! `SyncSettings` tells a client shell where the sync backend lives and how
//! aggressively the sync loop talks to it.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::util::is_http_url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Base URL of the sync API, without trailing slash
    pub api_base_url: String,
    /// Per-request timeout; an expired timeout counts as a transport failure
    pub request_timeout: Duration,
    /// How long a cycle with an empty queue waits before pulling again
    pub pull_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Bearer token handed to the sync API, if already known
    pub access_token: Option<String>,
}

impl fmt::Debug for SyncSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncSettings")
            .field("api_base_url", &self.api_base_url)
            .field("request_timeout", &self.request_timeout)
            .field("pull_interval", &self.pull_interval)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = required_trimmed(&lookup, "WAYFARE_API_BASE_URL")?;
        if !is_http_url(&api_base_url) {
            return Err(ConfigError::Invalid(
                "WAYFARE_API_BASE_URL must start with http:// or https://".to_string(),
            ));
        }
        let api_base_url = api_base_url.trim_end_matches('/').to_string();

        let timeout_secs = ranged_u64(&lookup, "WAYFARE_SYNC_TIMEOUT_SECS", 15, 1..=120)?;
        let pull_interval_secs =
            ranged_u64(&lookup, "WAYFARE_SYNC_PULL_INTERVAL_SECS", 300, 10..=86_400)?;
        let backoff_base_ms =
            ranged_u64(&lookup, "WAYFARE_SYNC_BACKOFF_BASE_MS", 2_000, 100..=60_000)?;
        let backoff_max_secs = ranged_u64(&lookup, "WAYFARE_SYNC_BACKOFF_MAX_SECS", 300, 1..=3_600)?;

        let backoff_base = Duration::from_millis(backoff_base_ms);
        let backoff_max = Duration::from_secs(backoff_max_secs);
        if backoff_max < backoff_base {
            return Err(ConfigError::Invalid(
                "WAYFARE_SYNC_BACKOFF_MAX_SECS must not be below WAYFARE_SYNC_BACKOFF_BASE_MS"
                    .to_string(),
            ));
        }

        Ok(Self {
            api_base_url,
            request_timeout: Duration::from_secs(timeout_secs),
            pull_interval: Duration::from_secs(pull_interval_secs),
            backoff_base,
            backoff_max,
            access_token: optional_trimmed(&lookup, "WAYFARE_ACCESS_TOKEN"),
        })
    }

    /// Settings for a given base URL with every tunable at its default
    pub fn with_base_url(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(15),
            pull_interval: Duration::from_secs(300),
            backoff_base: Duration::from_millis(2_000),
            backoff_max: Duration::from_secs(300),
            access_token: None,
        }
    }
}

fn ranged_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Result<SyncSettings, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        SyncSettings::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn settings_require_base_url() {
        assert_eq!(
            settings(&[]).unwrap_err(),
            ConfigError::MissingVar("WAYFARE_API_BASE_URL")
        );
        assert!(settings(&[("WAYFARE_API_BASE_URL", "ftp://example.com")]).is_err());
    }

    #[test]
    fn settings_apply_defaults_and_trim_url() {
        let settings = settings(&[("WAYFARE_API_BASE_URL", " https://api.example.com/ ")]).unwrap();
        assert_eq!(settings, SyncSettings::with_base_url("https://api.example.com"));
    }

    #[test]
    fn settings_validate_ranges() {
        let error = settings(&[
            ("WAYFARE_API_BASE_URL", "https://api.example.com"),
            ("WAYFARE_SYNC_TIMEOUT_SECS", "0"),
        ])
        .unwrap_err();
        assert!(error.to_string().contains("WAYFARE_SYNC_TIMEOUT_SECS"));

        let error = settings(&[
            ("WAYFARE_API_BASE_URL", "https://api.example.com"),
            ("WAYFARE_SYNC_BACKOFF_BASE_MS", "60000"),
            ("WAYFARE_SYNC_BACKOFF_MAX_SECS", "30"),
        ])
        .unwrap_err();
        assert!(error.to_string().contains("BACKOFF_MAX"));
    }

    #[test]
    fn settings_redact_access_token() {
        let settings = settings(&[
            ("WAYFARE_API_BASE_URL", "https://api.example.com"),
            ("WAYFARE_ACCESS_TOKEN", "sensitive-bearer-token"),
        ])
        .unwrap();

        let debug_output = format!("{settings:?}");
        assert!(!debug_output.contains("sensitive-bearer-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
