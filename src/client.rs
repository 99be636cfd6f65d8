//! One-shot helpers: connect, exchange, close.
//!
//! Each helper opens a fresh connection for a single exchange. Use a
//! [`ConnPool`](crate::ConnPool) when talking to the same address repeatedly.

use std::net::{TcpListener, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;

use crate::codec::PkgOptions;
use crate::connection::RetryPolicy;
use crate::error::Result;
use crate::transport::{DatagramConn, StreamConn};

/// Connect, run `f`, close. The result of `f` wins over a close error.
fn with_stream<A, R>(addr: A, f: impl FnOnce(&mut StreamConn) -> Result<R>) -> Result<R>
where
    A: ToSocketAddrs,
{
    let mut conn = StreamConn::connect(addr)?;
    let result = f(&mut conn);
    let closed = conn.close();
    let value = result?;
    closed?;
    Ok(value)
}

/// Send `data` to `addr` over a new stream connection.
pub fn send<A: ToSocketAddrs>(addr: A, data: &[u8], retry: Option<RetryPolicy>) -> Result<()> {
    with_stream(addr, |conn| conn.send(data, retry))
}

/// Send `data` to `addr` and receive the reply; see [`StreamConn::recv`] for
/// the meaning of `length`.
pub fn send_recv<A: ToSocketAddrs>(
    addr: A,
    data: &[u8],
    length: isize,
    retry: Option<RetryPolicy>,
) -> Result<Vec<u8>> {
    with_stream(addr, |conn| conn.send_recv(data, length, retry))
}

/// Send `data` to `addr` within `timeout`.
pub fn send_with_timeout<A: ToSocketAddrs>(
    addr: A,
    data: &[u8],
    timeout: Duration,
    retry: Option<RetryPolicy>,
) -> Result<()> {
    with_stream(addr, |conn| conn.send_with_timeout(data, timeout, retry))
}

/// Send `data` to `addr` and receive the reply within `timeout`.
pub fn send_recv_with_timeout<A: ToSocketAddrs>(
    addr: A,
    data: &[u8],
    length: isize,
    timeout: Duration,
    retry: Option<RetryPolicy>,
) -> Result<Vec<u8>> {
    with_stream(addr, |conn| {
        conn.send_recv_with_timeout(data, length, timeout, retry)
    })
}

/// Send one length-prefixed packet to `addr`.
pub fn send_pkg<A: ToSocketAddrs>(addr: A, data: &[u8], options: &PkgOptions) -> Result<()> {
    with_stream(addr, |conn| conn.send_pkg(data, options))
}

/// Send one packet to `addr` and receive the reply packet.
pub fn send_recv_pkg<A: ToSocketAddrs>(
    addr: A,
    data: &[u8],
    options: &PkgOptions,
) -> Result<Bytes> {
    with_stream(addr, |conn| conn.send_recv_pkg(data, options))
}

/// Send one packet to `addr` within `timeout`.
pub fn send_pkg_with_timeout<A: ToSocketAddrs>(
    addr: A,
    data: &[u8],
    timeout: Duration,
    options: &PkgOptions,
) -> Result<()> {
    with_stream(addr, |conn| conn.send_pkg_with_timeout(data, timeout, options))
}

/// Send one packet to `addr` and receive the reply packet within `timeout`.
pub fn send_recv_pkg_with_timeout<A: ToSocketAddrs>(
    addr: A,
    data: &[u8],
    timeout: Duration,
    options: &PkgOptions,
) -> Result<Bytes> {
    with_stream(addr, |conn| {
        conn.send_recv_pkg_with_timeout(data, timeout, options)
    })
}

/// Send one datagram to `addr` from an ephemeral port.
pub fn udp_send<A: ToSocketAddrs>(addr: A, data: &[u8], retry: Option<RetryPolicy>) -> Result<()> {
    let mut conn = DatagramConn::connect(addr)?;
    conn.send(data, retry)?;
    conn.close()
}

/// Send one datagram to `addr` and receive the reply.
pub fn udp_send_recv<A: ToSocketAddrs>(
    addr: A,
    data: &[u8],
    length: isize,
    retry: Option<RetryPolicy>,
) -> Result<Vec<u8>> {
    let mut conn = DatagramConn::connect(addr)?;
    let reply = conn.send_recv(data, length, retry)?;
    conn.close()?;
    Ok(reply)
}

/// Ask the OS for a free local TCP port.
///
/// The port is released before returning, so another process may take it
/// first.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Ask the OS for `count` distinct free local TCP ports.
pub fn free_ports(count: usize) -> Result<Vec<u16>> {
    // Hold every listener until all ports are known so none repeats.
    let listeners = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0"))
        .collect::<std::io::Result<Vec<_>>>()?;
    listeners
        .iter()
        .map(|listener| -> Result<u16> { Ok(listener.local_addr()?.port()) })
        .collect()
}
