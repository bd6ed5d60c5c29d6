//! Link timing configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ble::backoff::BackoffPolicy;
use crate::ble::uuids::REQUESTED_MTU;

/// Timing and retry parameters of the connection manager.
///
/// The defaults are the values the SensePi firmware has been tuned against;
/// most hosts never change them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Interval of the fallback INFO read while the link is ready.
    pub poll_interval: Duration,
    /// Period of the wake-scan cycle while no link is up.
    pub wake_scan_period: Duration,
    /// How long each wake scan runs.
    pub wake_scan_duration: Duration,
    /// Rediscovery delay step; attempt `n` waits `n * step`.
    pub rediscover_step: Duration,
    /// Delay before retrying a discovery that failed at the transport level.
    pub discovery_failure_retry: Duration,
    /// In-place rediscovery attempts before escalating to a full reconnect.
    pub max_rediscover_tries: u32,
    /// Attempts on which the stack's service cache is refreshed first.
    pub cache_refresh_tries: Vec<u32>,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Upper bound of the reconnect delay.
    pub backoff_cap: Duration,
    /// MTU requested when the link comes up.
    pub mtu: u16,
}

impl LinkConfig {
    /// Default poll interval (15 seconds).
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
    /// Default wake-scan period (60 seconds).
    pub const DEFAULT_WAKE_SCAN_PERIOD: Duration = Duration::from_secs(60);
    /// Default wake-scan duration (5 seconds).
    pub const DEFAULT_WAKE_SCAN_DURATION: Duration = Duration::from_secs(5);
    /// Default rediscovery step (1.2 seconds).
    pub const DEFAULT_REDISCOVER_STEP: Duration = Duration::from_millis(1200);
    /// Default discovery failure retry (1 second).
    pub const DEFAULT_DISCOVERY_FAILURE_RETRY: Duration = Duration::from_millis(1000);
    /// Default in-place rediscovery budget.
    pub const DEFAULT_MAX_REDISCOVER_TRIES: u32 = 6;

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the wake-scan period and duration.
    pub fn with_wake_scan(mut self, period: Duration, duration: Duration) -> Self {
        self.wake_scan_period = period;
        self.wake_scan_duration = duration;
        self
    }

    /// Set the rediscovery parameters.
    pub fn with_rediscovery(mut self, step: Duration, max_tries: u32) -> Self {
        self.rediscover_step = step;
        self.max_rediscover_tries = max_tries;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Backoff policy built from the configured bounds.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_cap)
    }

    /// Delay before in-place rediscovery attempt `tries` (1-based).
    pub fn rediscover_delay(&self, tries: u32) -> Duration {
        self.rediscover_step.saturating_mul(tries)
    }

    /// Whether the stack cache should be refreshed before attempt `tries`.
    pub fn refreshes_cache_on(&self, tries: u32) -> bool {
        self.cache_refresh_tries.contains(&tries)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            wake_scan_period: Self::DEFAULT_WAKE_SCAN_PERIOD,
            wake_scan_duration: Self::DEFAULT_WAKE_SCAN_DURATION,
            rediscover_step: Self::DEFAULT_REDISCOVER_STEP,
            discovery_failure_retry: Self::DEFAULT_DISCOVERY_FAILURE_RETRY,
            max_rediscover_tries: Self::DEFAULT_MAX_REDISCOVER_TRIES,
            cache_refresh_tries: vec![2, 4],
            backoff_base: BackoffPolicy::DEFAULT_BASE,
            backoff_cap: BackoffPolicy::DEFAULT_CAP,
            mtu: REQUESTED_MTU,
        }
    }
}
