//! Per-account request budgets for the sync endpoints.
//!
//! Every (endpoint, account) pair owns one fixed window. Windows idle for a
//! full period are swept once the table grows, so memory tracks the accounts
//! that are actually syncing rather than every account ever seen.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Table size that triggers a sweep of idle windows
const SWEEP_THRESHOLD: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectedEndpoint {
    Push,
    Migrate,
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Push => "sync_push",
            Self::Migrate => "sync_migrate",
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Push => 0,
            Self::Migrate => 1,
        }
    }
}

type WindowKey = (ProtectedEndpoint, String);

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    opened_at: Instant,
    spent: u32,
}

impl RateWindow {
    const fn open(now: Instant) -> Self {
        Self {
            opened_at: now,
            spent: 0,
        }
    }

    fn has_lapsed(&self, now: Instant, period: Duration) -> bool {
        now.duration_since(self.opened_at) >= period
    }
}

#[derive(Default)]
struct EndpointCounters {
    allowed: AtomicU64,
    limited: AtomicU64,
}

impl EndpointCounters {
    fn usage(&self) -> EndpointUsage {
        EndpointUsage {
            allowed: self.allowed.load(Ordering::Relaxed),
            limited: self.limited.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointUsage {
    pub allowed: u64,
    pub limited: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub push: EndpointUsage,
    pub migrate: EndpointUsage,
    /// Live windows, one per endpoint and active account
    pub tracked_windows: usize,
}

#[derive(Clone)]
pub struct AccountRateLimiter {
    windows: Arc<Mutex<HashMap<WindowKey, RateWindow>>>,
    period: Duration,
    budgets: [u32; 2],
    counters: Arc<[EndpointCounters; 2]>,
    sweep_threshold: usize,
}

impl AccountRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.push_rate_limit_per_window,
            config.migrate_rate_limit_per_window,
        )
    }

    pub fn new(period: Duration, push_budget: u32, migrate_budget: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            period,
            budgets: [push_budget, migrate_budget],
            counters: Arc::new([EndpointCounters::default(), EndpointCounters::default()]),
            sweep_threshold: SWEEP_THRESHOLD,
        }
    }

    /// Spend one request of `account_id`'s budget for `endpoint`
    pub async fn check(&self, endpoint: ProtectedEndpoint, account_id: &str) -> Result<(), AppError> {
        let now = Instant::now();
        let budget = self.budgets[endpoint.slot()];
        let counters = &self.counters[endpoint.slot()];

        let mut windows = self.windows.lock().await;
        if windows.len() >= self.sweep_threshold {
            self.sweep(&mut windows, now);
        }

        let window = windows
            .entry((endpoint, account_id.to_string()))
            .or_insert_with(|| RateWindow::open(now));
        if window.has_lapsed(now, self.period) {
            *window = RateWindow::open(now);
        }

        if window.spent < budget {
            window.spent += 1;
            counters.allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Round up so clients never retry inside the same window
        let remaining = self
            .period
            .saturating_sub(now.duration_since(window.opened_at));
        let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        counters.limited.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            endpoint = endpoint.label(),
            account = account_fingerprint(account_id),
            retry_after_secs,
            "Rate limit exceeded"
        );
        Err(AppError::too_many_requests(
            format!("Rate limit exceeded for {}", endpoint.label()),
            retry_after_secs,
        ))
    }

    fn sweep(&self, windows: &mut HashMap<WindowKey, RateWindow>, now: Instant) {
        let before = windows.len();
        windows.retain(|_, window| !window.has_lapsed(now, self.period));
        tracing::debug!(
            evicted = before - windows.len(),
            remaining = windows.len(),
            "Swept idle rate-limit windows"
        );
    }

    pub async fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            push: self.counters[ProtectedEndpoint::Push.slot()].usage(),
            migrate: self.counters[ProtectedEndpoint::Migrate.slot()].usage(),
            tracked_windows: self.windows.lock().await.len(),
        }
    }
}

/// Stable per-process hash so logs never carry raw account ids
pub fn account_fingerprint(account_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    account_id.hash(&mut hasher);
    hasher.finish()
}
