//! Pooled connection status and pool statistics.

use std::time::Instant;

/// Health of a borrowed pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnStatus {
    /// Taken from the pool and not used yet.
    #[default]
    Unknown,
    /// Last operation succeeded.
    Active,
    /// Last operation failed.
    Error,
}

impl ConnStatus {
    /// Check if the connection may go back to the pool.
    pub fn is_reusable(&self) -> bool {
        *self == ConnStatus::Active
    }
}

/// Per-address pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections dialed, reconnects included.
    pub dialed: u64,
    /// Borrows served from idle connections.
    pub reused: u64,
    /// Connections returned to the pool.
    pub returned: u64,
    /// Connections closed instead of returned.
    pub discarded: u64,
    /// Idle connections dropped after the idle timeout.
    pub expired: u64,
    /// Time of the last dial.
    pub last_dialed: Option<Instant>,
}

impl PoolStats {
    /// Record a new dial.
    pub fn record_dial(&mut self) {
        self.dialed += 1;
        self.last_dialed = Some(Instant::now());
    }

    /// Record a borrow served from the idle list.
    pub fn record_reuse(&mut self) {
        self.reused += 1;
    }

    /// Record a connection going back to the idle list.
    pub fn record_return(&mut self) {
        self.returned += 1;
    }

    /// Record a connection closed on release.
    pub fn record_discard(&mut self) {
        self.discarded += 1;
    }

    /// Record idle connections dropped by expiry.
    pub fn record_expired(&mut self, count: usize) {
        self.expired += count as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_status() {
        assert_eq!(ConnStatus::default(), ConnStatus::Unknown);
        assert!(ConnStatus::Active.is_reusable());
        assert!(!ConnStatus::Unknown.is_reusable());
        assert!(!ConnStatus::Error.is_reusable());
    }

    #[test]
    fn test_pool_stats() {
        let mut stats = PoolStats::default();

        stats.record_dial();
        assert_eq!(stats.dialed, 1);
        assert!(stats.last_dialed.is_some());

        stats.record_reuse();
        stats.record_return();
        stats.record_discard();
        stats.record_expired(2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.returned, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.expired, 2);
    }
}
