//! TCP packet echo server example.
//!
//! Accepts connections and echoes back every length-prefixed packet.
//!
//! Run with: cargo run --example tcp_server
//! Then connect with: cargo run --example tcp_client

use pktconn::{PkgOptions, StreamConn, TcpServer};
use std::sync::Arc;

const BIND_ADDR: &str = "127.0.0.1:9000";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting packet echo server on {BIND_ADDR}...");

    let server = TcpServer::new(
        BIND_ADDR,
        Arc::new(|mut conn: StreamConn| {
            let peer = conn
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            println!("New connection from {peer}");

            let options = PkgOptions::default();
            loop {
                match conn.recv_pkg(&options) {
                    Ok(data) => {
                        println!(
                            "Received {} bytes: {:?}",
                            data.len(),
                            String::from_utf8_lossy(&data)
                        );
                        if let Err(e) = conn.send_pkg(&data, &options) {
                            eprintln!("Failed to send reply: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!("Connection error: {e}");
                        break;
                    }
                }
            }
            println!("Connection closed: {peer}");
        }),
    );

    server.listen()?;
    println!("Server listening on {:?}", server.listened_addr());
    server.serve()?;

    Ok(())
}
