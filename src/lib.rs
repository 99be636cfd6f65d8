//! Stream and datagram connections with length-prefixed packet framing,
//! built on std::net.
//!
//! # Features
//!
//! - Stream and datagram connections with retrying sends and receives
//! - Cached read/write deadlines and scoped timeout helpers
//! - Length-prefixed stream packets with a 1 to 4 byte header
//! - Checksummed datagram packets with resynchronization on corrupt input
//! - Per-address connection pooling with stale connection recovery
//! - Thread-per-connection stream server and datagram server
//! - Optional async stream connection (`tokio` feature)
//!
//! # Example
//!
//! ```no_run
//! use pktconn::{PkgOptions, RetryPolicy, StreamConn};
//! use std::time::Duration;
//!
//! let mut conn = StreamConn::connect("127.0.0.1:9000").unwrap();
//!
//! let options = PkgOptions::default().with_retry(RetryPolicy::new(3, Duration::from_millis(50)));
//! let reply = conn
//!     .send_recv_pkg_with_timeout(b"hello", Duration::from_secs(5), &options)
//!     .unwrap();
//!
//! println!("Reply: {:?}", reply);
//! ```
//!
//! # Wire Formats
//!
//! Stream packets carry a big-endian payload length in a header of
//! 1 to 4 bytes (2 by default):
//!
//! ```text
//! +--------+--------+--------+-----
//! |  Length (N bytes)|  Payload ...
//! +--------+--------+--------+-----
//! ```
//!
//! Datagram packets carry the total packet length and a checksum of the
//! payload, the sum of its bytes:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+-----
//! |   Total length (3 bytes) |        Checksum (4 bytes)         | Payload ...
//! +--------+--------+--------+--------+--------+--------+--------+-----
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod server;
pub mod transport;

// Async modules (require tokio feature)
#[cfg(feature = "tokio")]
pub mod transport_async;

// Re-export commonly used types at the crate root
pub use codec::PkgOptions;
pub use connection::{ConnPool, ConnStatus, PoolConfig, PoolConn, RetryPolicy};
pub use error::{NetError, Result};
pub use server::{ServerRegistry, ServerState, TcpServer, UdpServer};
pub use transport::{Connection, DatagramConn, StreamConn};
