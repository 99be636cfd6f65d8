//! Connection pooling and retry configuration.
//!
//! This module provides:
//! - [`RetryPolicy`], the retry value accepted by every send and receive
//! - [`ConnPool`], a per-address pool of stream connections
//! - [`PoolConn`], a borrowed connection tracking its own health
//!
//! # Connection Pooling
//!
//! ```no_run
//! use pktconn::connection::{ConnPool, PoolConfig};
//! use pktconn::PkgOptions;
//! use std::time::Duration;
//!
//! let pool = ConnPool::new(PoolConfig::default().with_idle_timeout(Duration::from_secs(30)));
//!
//! let mut conn = pool.get("127.0.0.1:9000").unwrap();
//! let reply = conn.send_recv_pkg(b"ping", &PkgOptions::default()).unwrap();
//! println!("reply: {reply:?}");
//!
//! // A healthy connection goes back to the pool, a failed one is closed.
//! conn.close().unwrap();
//! ```

mod config;
mod pool;
mod state;

pub use config::{
    PoolConfig, RetryPolicy, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_IDLE_PER_ADDR,
    DEFAULT_RETRY_INTERVAL,
};
pub use pool::{ConnPool, Dialer, PoolConn};
pub use state::{ConnStatus, PoolStats};
