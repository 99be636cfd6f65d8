//! Async stream connection using Tokio.
//!
//! Enabled by the `tokio` feature.
//!
//! # Example
//!
//! ```no_run
//! use pktconn::transport_async::AsyncStreamConn;
//! use pktconn::PkgOptions;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut conn = AsyncStreamConn::connect("127.0.0.1:9000").await?;
//!
//!     let reply = conn.send_recv_pkg(b"ping", &PkgOptions::default()).await?;
//!     println!("Reply: {:?}", reply);
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

mod tcp;

pub use tcp::AsyncStreamConn;
