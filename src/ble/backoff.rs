//! Reconnect backoff.

use std::time::Duration;

/// Bounded exponential backoff: `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// Default first delay (1 second).
    pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
    /// Default upper bound (30 seconds).
    pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

    /// Create a policy with a custom base and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before reconnect attempt number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 seconds is far beyond any sane cap, so saturating here is enough.
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// The configured upper bound.
    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CAP)
    }
}
