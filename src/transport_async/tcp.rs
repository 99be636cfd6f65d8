//! Async stream connection with length-prefixed packet framing.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::codec::{encode_stream_packet, try_extract_stream_packet, PkgOptions};
use crate::error::{NetError, Result};
use crate::transport::{DEFAULT_RECV_BUFFER_WAIT, READ_ALL_BUFFER_SIZE};

/// Run `future` for at most `duration`, mapping expiry to [`NetError::Timeout`].
async fn with_timeout<R>(duration: Duration, future: impl Future<Output = Result<R>>) -> Result<R> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| NetError::Timeout)?
}

/// An async stream connection.
///
/// Uses the same wire format as [`StreamConn`](crate::StreamConn), so either
/// side of a connection may be async or blocking.
#[derive(Debug)]
pub struct AsyncStreamConn<S = TcpStream> {
    stream: BufReader<S>,
    buffer: BytesMut,
    recv_buffer_wait: Duration,
}

impl AsyncStreamConn<TcpStream> {
    /// Connect to a remote address.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to a remote address with a timeout.
    pub async fn connect_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self> {
        with_timeout(timeout, Self::connect(addr)).await
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().peer_addr()
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().local_addr()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncStreamConn<S> {
    /// Wrap an established stream.
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            buffer: BytesMut::new(),
            recv_buffer_wait: DEFAULT_RECV_BUFFER_WAIT,
        }
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Set how long an unbounded receive waits for more data.
    pub fn set_recv_buffer_wait(&mut self, wait: Duration) {
        self.recv_buffer_wait = wait;
    }

    /// Send all of `data`.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(NetError::from_io)?;
        self.stream.flush().await.map_err(NetError::from_io)
    }

    /// Receive data.
    ///
    /// `length > 0` reads exactly `length` bytes, `length == 0` performs one
    /// read and `length < 0` reads everything available, waiting at most the
    /// buffer wait for more once a read filled the scratch buffer.
    ///
    /// Received bytes are held in the connection until returned, so a receive
    /// dropped by a timeout loses nothing; bytes still buffered from an
    /// earlier call are returned first.
    pub async fn recv(&mut self, length: isize) -> Result<Vec<u8>> {
        if length > 0 {
            let length = length as usize;
            while self.buffer.len() < length {
                let n = self
                    .stream
                    .read_buf(&mut self.buffer)
                    .await
                    .map_err(NetError::from_io)?;
                if n == 0 {
                    return Err(NetError::ConnectionClosed);
                }
            }
            return Ok(self.buffer.split_to(length).to_vec());
        }

        if self.buffer.is_empty() {
            let mut filled = self.read_chunk().await? == READ_ALL_BUFFER_SIZE;
            while length < 0 && filled {
                match tokio::time::timeout(self.recv_buffer_wait, self.read_chunk()).await {
                    Ok(Ok(n)) => filled = n == READ_ALL_BUFFER_SIZE,
                    Ok(Err(NetError::ConnectionClosed)) | Err(_) => break,
                    Ok(Err(e)) => return Err(e),
                }
            }
        }
        Ok(self.buffer.split().to_vec())
    }

    /// Read once into the receive buffer; end of stream is
    /// [`NetError::ConnectionClosed`].
    async fn read_chunk(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_ALL_BUFFER_SIZE];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(NetError::from_io)?;
        if n == 0 {
            return Err(NetError::ConnectionClosed);
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Receive one line, stripping the trailing `\n` or `\r\n`.
    pub async fn recv_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1).to_vec();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            self.read_chunk().await?;
        }
    }

    /// Send one length-prefixed packet.
    pub async fn send_pkg(&mut self, data: &[u8], options: &PkgOptions) -> Result<()> {
        let packet = encode_stream_packet(data, options)?;
        self.send(&packet).await
    }

    /// Receive one length-prefixed packet.
    pub async fn recv_pkg(&mut self, options: &PkgOptions) -> Result<Bytes> {
        loop {
            if let Some(packet) = try_extract_stream_packet(&mut self.buffer, options)? {
                return Ok(packet);
            }
            let n = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(NetError::from_io)?;
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
        }
    }

    /// Send one packet and receive the reply packet.
    pub async fn send_recv_pkg(&mut self, data: &[u8], options: &PkgOptions) -> Result<Bytes> {
        self.send_pkg(data, options).await?;
        self.recv_pkg(options).await
    }

    /// Send with a timeout.
    pub async fn send_with_timeout(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        with_timeout(timeout, self.send(data)).await
    }

    /// Receive with a timeout.
    pub async fn recv_with_timeout(&mut self, length: isize, timeout: Duration) -> Result<Vec<u8>> {
        with_timeout(timeout, self.recv(length)).await
    }

    /// Send one packet with a timeout.
    pub async fn send_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        options: &PkgOptions,
    ) -> Result<()> {
        with_timeout(timeout, self.send_pkg(data, options)).await
    }

    /// Receive one packet with a timeout.
    ///
    /// Bytes that arrived before the timeout stay buffered for the next call.
    pub async fn recv_pkg_with_timeout(
        &mut self,
        timeout: Duration,
        options: &PkgOptions,
    ) -> Result<Bytes> {
        with_timeout(timeout, self.recv_pkg(options)).await
    }

    /// Send one packet and receive the reply packet within `timeout`.
    pub async fn send_recv_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        options: &PkgOptions,
    ) -> Result<Bytes> {
        self.send_pkg(data, options).await?;
        self.recv_pkg_with_timeout(timeout, options).await
    }

    /// Shut down the write half and drop the connection.
    pub async fn close(mut self) -> Result<()> {
        match self.stream.shutdown().await {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => Ok(other?),
        }
    }
}
