//! UDP checksummed packet echo example.
//!
//! Starts a datagram server on an ephemeral port, sends a few packets to it
//! and closes it again.
//!
//! Run with: cargo run --example udp_echo

use pktconn::{DatagramConn, UdpServer};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(UdpServer::new(
        "127.0.0.1:0",
        Arc::new(|mut conn: DatagramConn| {
            while let Ok(data) = conn.recv_pkg(None) {
                println!("Server received {:?}", String::from_utf8_lossy(&data));
                if conn.send_pkg(&data, None).is_err() {
                    break;
                }
            }
            println!("Server handler finished");
        }),
    ));

    server.listen()?;
    let addr = server.listened_addr().ok_or("server has no address")?;
    println!("UDP server listening on {addr}");

    let serving = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve())
    };

    let mut client = DatagramConn::connect(addr)?;
    for message in ["one", "two", "three"] {
        let reply = client.send_recv_pkg_with_timeout(message.as_bytes(), Duration::from_secs(2), None)?;
        println!("Client got {:?}", String::from_utf8_lossy(&reply));
    }

    server.close()?;
    serving.join().map_err(|_| "server thread panicked")??;
    println!("Server closed");

    Ok(())
}
