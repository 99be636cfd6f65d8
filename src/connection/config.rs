//! Retry and pool configuration types.

use std::time::Duration;

/// Interval used when a retry policy leaves it unset.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default idle time before a pooled connection expires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Default number of idle connections kept per address.
pub const DEFAULT_MAX_IDLE_PER_ADDR: usize = 64;

/// Retry policy for a single send or receive call.
///
/// The policy is copied into each call and the copy is decremented after
/// every failed attempt, so a value can be reused across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Remaining retry attempts after the first one.
    pub count: u32,
    /// Delay between attempts. Zero means [`DEFAULT_RETRY_INTERVAL`].
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy with `count` retries spaced by `interval`.
    pub fn new(count: u32, interval: Duration) -> Self {
        Self { count, interval }
    }

    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Check if another retry attempt is left.
    pub fn should_retry(&self) -> bool {
        self.count > 0
    }

    /// Consume one retry attempt.
    ///
    /// Returns the delay to sleep before the next attempt, or `None` once the
    /// policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        if self.interval.is_zero() {
            self.interval = DEFAULT_RETRY_INTERVAL;
        }
        Some(self.interval)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle timeout before a pooled connection is dropped.
    pub idle_timeout: Duration,
    /// Maximum idle connections kept per address.
    pub max_idle_per_addr: usize,
    /// Timeout for dialing new connections. `None` blocks until the OS gives up.
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_idle_per_addr: DEFAULT_MAX_IDLE_PER_ADDR,
            connect_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum idle connections per address.
    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle_per_addr = max;
        self
    }

    /// Set the dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}
