//! TCP packet client example.
//!
//! Sends packets to the echo server, first over a plain connection and then
//! through a connection pool.
//!
//! Run the server first: cargo run --example tcp_server
//! Then run: cargo run --example tcp_client

use pktconn::{ConnPool, PkgOptions, PoolConfig, RetryPolicy, StreamConn};
use std::time::Duration;

const SERVER_ADDR: &str = "127.0.0.1:9000";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Connecting to packet server at {SERVER_ADDR}...");

    let options = PkgOptions::default().with_retry(RetryPolicy::new(3, Duration::from_millis(100)));

    // Example 1: Plain connection
    println!("\n--- Example 1: Plain Connection ---");
    let mut conn = StreamConn::connect_timeout(SERVER_ADDR, Duration::from_secs(5))?;
    for message in ["Hello", "packet", "framing"] {
        let reply = conn.send_recv_pkg_with_timeout(message.as_bytes(), Duration::from_secs(5), &options)?;
        println!("Sent {message:?}, got {:?}", String::from_utf8_lossy(&reply));
    }
    conn.close()?;

    // Example 2: Pooled connections
    println!("\n--- Example 2: Pooled Connections ---");
    let pool = ConnPool::new(PoolConfig::default().with_connect_timeout(Duration::from_secs(5)));
    for round in 1..=3 {
        let mut conn = pool.get(SERVER_ADDR)?;
        let reply = conn.send_recv_pkg(format!("round {round}").as_bytes(), &options)?;
        println!(
            "Round {round}: reply {:?}, status {:?}",
            String::from_utf8_lossy(&reply),
            conn.status()
        );
        conn.close()?;
    }
    println!("Pool stats: {:?}", pool.stats(SERVER_ADDR));

    println!("\nDone!");
    Ok(())
}
