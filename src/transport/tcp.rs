//! Buffered stream connection with retries, deadlines and packet framing.

use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::codec::{encode_stream_packet, try_extract_stream_packet, PkgOptions};
use crate::connection::RetryPolicy;
use crate::error::{is_timeout_kind, NetError, Result};

use super::{
    timeout_until, Connection, StreamTransport, DEFAULT_RECV_BUFFER_WAIT, READ_ALL_BUFFER_SIZE,
};

/// A stream connection.
///
/// Reads go through a buffered reader. Packet receives keep a reassembly
/// buffer across calls, so a connection must be driven by one thread at a
/// time (enforced by `&mut self`).
#[derive(Debug)]
pub struct StreamConn<T: StreamTransport = TcpStream> {
    reader: BufReader<T>,
    buffer: BytesMut,
    recv_deadline: Option<Instant>,
    send_deadline: Option<Instant>,
    recv_buffer_wait: Duration,
}

impl StreamConn<TcpStream> {
    /// Connect to a remote address.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self::from_transport(stream))
    }

    /// Connect to a remote address with a timeout.
    ///
    /// Every resolved address is tried in turn; the last error is returned.
    pub fn connect_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(Self::from_transport(stream)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(NetError::from_io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "No address provided")
        })))
    }
}

impl<T: StreamTransport> StreamConn<T> {
    /// Wrap an established transport.
    pub fn from_transport(transport: T) -> Self {
        Self {
            reader: BufReader::new(transport),
            buffer: BytesMut::new(),
            recv_deadline: None,
            send_deadline: None,
            recv_buffer_wait: DEFAULT_RECV_BUFFER_WAIT,
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.reader.get_ref()
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().peer_addr()
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().local_addr()
    }

    /// Shut the connection down.
    pub fn close(self) -> Result<()> {
        match self.get_ref().shutdown() {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => Ok(other?),
        }
    }

    /// Current receive deadline.
    pub fn recv_deadline(&self) -> Option<Instant> {
        self.recv_deadline
    }

    /// Current send deadline.
    pub fn send_deadline(&self) -> Option<Instant> {
        self.send_deadline
    }

    /// Set the receive deadline. `None` removes it.
    ///
    /// The cached value only changes when the socket accepted the timeout.
    pub fn set_recv_deadline(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.get_ref().set_read_timeout(timeout_until(deadline))?;
        self.recv_deadline = deadline;
        Ok(())
    }

    /// Set the send deadline. `None` removes it.
    pub fn set_send_deadline(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.get_ref().set_write_timeout(timeout_until(deadline))?;
        self.send_deadline = deadline;
        Ok(())
    }

    /// Set both deadlines.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.set_recv_deadline(deadline)?;
        self.set_send_deadline(deadline)
    }

    /// Set how long an unbounded receive waits for more data once it has
    /// started reading.
    ///
    /// Lower values return sooner but may cut a slow peer's message short.
    pub fn set_recv_buffer_wait(&mut self, wait: Duration) {
        self.recv_buffer_wait = wait;
    }

    /// Current unbounded receive wait.
    pub fn recv_buffer_wait(&self) -> Duration {
        self.recv_buffer_wait
    }

    /// Send all of `data`, looping on partial writes.
    ///
    /// Write errors are retried per `retry`. A peer that stops accepting data
    /// fails the call at once.
    pub fn send(&mut self, data: &[u8], retry: Option<RetryPolicy>) -> Result<()> {
        let mut retry = retry.unwrap_or_default();
        let mut written = 0;
        while written < data.len() {
            if let Some(timeout) = timeout_until(self.send_deadline) {
                self.get_ref().set_write_timeout(Some(timeout))?;
            }
            match self.reader.get_mut().write(&data[written..]) {
                Ok(0) => return Err(NetError::ConnectionClosed),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => match retry.next_delay() {
                    Some(delay) => thread::sleep(delay),
                    None => return Err(NetError::from_io(e)),
                },
            }
        }
        self.reader.get_mut().flush()?;
        Ok(())
    }

    /// Receive data.
    ///
    /// - `length > 0`: exactly `length` bytes.
    /// - `length == 0`: whatever a single read returns.
    /// - `length < 0`: everything currently available. Once a read fills the
    ///   scratch buffer, further reads wait at most the buffer wait and the
    ///   first timeout ends the call successfully.
    ///
    /// End of stream before any byte arrives is [`NetError::ConnectionClosed`].
    pub fn recv(&mut self, length: isize, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        let mut draining = false;
        let result = self.recv_inner(length, retry.unwrap_or_default(), &mut draining);
        if draining {
            let restored = self.get_ref().set_read_timeout(timeout_until(self.recv_deadline));
            let data = result?;
            restored?;
            return Ok(data);
        }
        result
    }

    fn recv_inner(
        &mut self,
        length: isize,
        mut retry: RetryPolicy,
        draining: &mut bool,
    ) -> Result<Vec<u8>> {
        let mut buffer = if length > 0 {
            vec![0u8; length as usize]
        } else {
            vec![0u8; READ_ALL_BUFFER_SIZE]
        };
        let mut index = 0;

        loop {
            if length < 0 && index > 0 {
                if !*draining {
                    *draining = true;
                    self.get_ref().set_read_timeout(Some(self.recv_buffer_wait))?;
                }
            } else if let Some(timeout) = timeout_until(self.recv_deadline) {
                self.get_ref().set_read_timeout(Some(timeout))?;
            }

            match self.reader.read(&mut buffer[index..]) {
                Ok(0) => {
                    if index > 0 && length <= 0 {
                        break;
                    }
                    return Err(NetError::ConnectionClosed);
                }
                Ok(n) => {
                    index += n;
                    if length > 0 {
                        if index == buffer.len() {
                            break;
                        }
                    } else if length == 0 {
                        break;
                    } else if index == buffer.len() {
                        buffer.resize(buffer.len() + READ_ALL_BUFFER_SIZE, 0);
                    } else if !*draining {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if *draining && is_timeout_kind(e.kind()) => break,
                Err(e) => match retry.next_delay() {
                    Some(delay) => thread::sleep(delay),
                    None => return Err(NetError::from_io(e)),
                },
            }
        }

        buffer.truncate(index);
        Ok(buffer)
    }

    /// Receive one line, stripping the trailing `\n` or `\r\n`.
    pub fn recv_line(&mut self, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let byte = self.recv(1, retry)?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Receive until the data ends with `delimiter`, which is kept.
    pub fn recv_till(&mut self, delimiter: &[u8], retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        if delimiter.is_empty() {
            return Ok(data);
        }
        while !data.ends_with(delimiter) {
            let byte = self.recv(1, retry)?;
            data.push(byte[0]);
        }
        Ok(data)
    }

    /// Run `f` under a temporary receive deadline, restoring the previous one.
    fn scoped_recv_deadline<R>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let previous = self.recv_deadline;
        self.set_recv_deadline(Some(Instant::now() + timeout))?;
        let result = f(self);
        let restored = self.set_recv_deadline(previous);
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Run `f` under a temporary send deadline, restoring the previous one.
    fn scoped_send_deadline<R>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let previous = self.send_deadline;
        self.set_send_deadline(Some(Instant::now() + timeout))?;
        let result = f(self);
        let restored = self.set_send_deadline(previous);
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Receive with a timeout.
    pub fn recv_with_timeout(
        &mut self,
        length: isize,
        timeout: Duration,
        retry: Option<RetryPolicy>,
    ) -> Result<Vec<u8>> {
        self.scoped_recv_deadline(timeout, |conn| conn.recv(length, retry))
    }

    /// Send with a timeout.
    pub fn send_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        retry: Option<RetryPolicy>,
    ) -> Result<()> {
        self.scoped_send_deadline(timeout, |conn| conn.send(data, retry))
    }

    /// Send `data` and receive the reply.
    pub fn send_recv(
        &mut self,
        data: &[u8],
        length: isize,
        retry: Option<RetryPolicy>,
    ) -> Result<Vec<u8>> {
        self.send(data, retry)?;
        self.recv(length, retry)
    }

    /// Send `data` and receive the reply, bounding the receive by `timeout`.
    pub fn send_recv_with_timeout(
        &mut self,
        data: &[u8],
        length: isize,
        timeout: Duration,
        retry: Option<RetryPolicy>,
    ) -> Result<Vec<u8>> {
        self.send(data, retry)?;
        self.recv_with_timeout(length, timeout, retry)
    }

    /// Send one length-prefixed packet.
    ///
    /// Oversized payloads are rejected before anything is written.
    pub fn send_pkg(&mut self, data: &[u8], options: &PkgOptions) -> Result<()> {
        let packet = encode_stream_packet(data, options)?;
        self.send(&packet, options.retry())
    }

    /// Receive one length-prefixed packet.
    ///
    /// Bytes read past the end of the packet stay buffered for the next call.
    /// A header announcing more than the maximum data size discards all
    /// buffered bytes and fails with [`NetError::InvalidPacketLength`].
    pub fn recv_pkg(&mut self, options: &PkgOptions) -> Result<Bytes> {
        loop {
            if let Some(packet) = try_extract_stream_packet(&mut self.buffer, options)? {
                return Ok(packet);
            }
            let data = self.recv(-1, options.retry())?;
            self.buffer.extend_from_slice(&data);
        }
    }

    /// Send one packet with a timeout.
    pub fn send_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        options: &PkgOptions,
    ) -> Result<()> {
        self.scoped_send_deadline(timeout, |conn| conn.send_pkg(data, options))
    }

    /// Receive one packet with a timeout.
    pub fn recv_pkg_with_timeout(&mut self, timeout: Duration, options: &PkgOptions) -> Result<Bytes> {
        self.scoped_recv_deadline(timeout, |conn| conn.recv_pkg(options))
    }

    /// Send one packet and receive the reply packet.
    pub fn send_recv_pkg(&mut self, data: &[u8], options: &PkgOptions) -> Result<Bytes> {
        self.send_pkg(data, options)?;
        self.recv_pkg(options)
    }

    /// Send one packet and receive the reply packet within `timeout`.
    pub fn send_recv_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        options: &PkgOptions,
    ) -> Result<Bytes> {
        self.send_pkg(data, options)?;
        self.recv_pkg_with_timeout(timeout, options)
    }
}

impl<T: StreamTransport> Connection for StreamConn<T> {
    fn send(&mut self, data: &[u8], retry: Option<RetryPolicy>) -> Result<()> {
        StreamConn::send(self, data, retry)
    }

    fn recv(&mut self, length: isize, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        StreamConn::recv(self, length, retry)
    }

    fn recv_line(&mut self, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        StreamConn::recv_line(self, retry)
    }

    fn close(self) -> Result<()> {
        StreamConn::close(self)
    }
}
