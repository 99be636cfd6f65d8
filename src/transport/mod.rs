//! Stream and datagram connections.
//!
//! [`StreamConn`] and [`DatagramConn`] wrap a transport socket and add
//! retrying sends and receives, cached deadlines and packet framing. The
//! sockets are reached through the [`StreamTransport`] and
//! [`DatagramTransport`] traits, implemented here for `TcpStream` and
//! `UdpSocket`.

pub mod tcp;
pub mod udp;

#[cfg(test)]
pub(crate) mod mock;

pub use tcp::StreamConn;
pub use udp::DatagramConn;

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use crate::connection::RetryPolicy;
use crate::error::Result;

/// Scratch buffer increment for unbounded reads.
pub const READ_ALL_BUFFER_SIZE: usize = 1024;

/// Default wait for more data once an unbounded read has started.
pub const DEFAULT_RECV_BUFFER_WAIT: Duration = Duration::from_millis(1);

/// Smallest timeout handed to a socket. Zero is rejected by the OS layer.
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_micros(1);

/// A byte-stream socket usable by [`StreamConn`].
pub trait StreamTransport: Read + Write {
    /// Set the socket read timeout. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Set the socket write timeout. `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Remote address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Shut down both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl StreamTransport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// A message-oriented socket usable by [`DatagramConn`].
pub trait DatagramTransport {
    /// Send one datagram to `addr`.
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, returning its size and sender.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Set the socket read timeout. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Set the socket write timeout. `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramTransport for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_write_timeout(self, timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// The send/receive capability shared by plain and pooled stream connections.
pub trait Connection {
    /// Send all of `data`.
    fn send(&mut self, data: &[u8], retry: Option<RetryPolicy>) -> Result<()>;

    /// Receive `length` bytes; see [`StreamConn::recv`] for the length modes.
    fn recv(&mut self, length: isize, retry: Option<RetryPolicy>) -> Result<Vec<u8>>;

    /// Receive one line without its terminator.
    fn recv_line(&mut self, retry: Option<RetryPolicy>) -> Result<Vec<u8>>;

    /// Close the connection.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Convert an absolute deadline into a socket timeout.
///
/// A deadline in the past maps to the smallest timeout the socket accepts, so
/// the next operation fails with a timeout instead of blocking.
pub(crate) fn timeout_until(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| {
        d.saturating_duration_since(Instant::now())
            .max(MIN_SOCKET_TIMEOUT)
    })
}
