//! Per-address pooling of stream connections.

use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::codec::{encode_stream_packet, PkgOptions};
use crate::error::{NetError, Result};
use crate::transport::{Connection, StreamConn, StreamTransport};

use super::config::{PoolConfig, RetryPolicy};
use super::state::{ConnStatus, PoolStats};

/// Opens a transport to an address, honoring an optional connect timeout.
pub type Dialer<T> = Arc<dyn Fn(&str, Option<Duration>) -> io::Result<T> + Send + Sync>;

fn dial_tcp(addr: &str, timeout: Option<Duration>) -> io::Result<TcpStream> {
    match timeout {
        None => TcpStream::connect(addr),
        Some(timeout) => {
            let mut last_err = None;
            for addr in addr.to_socket_addrs()? {
                match TcpStream::connect_timeout(&addr, timeout) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "No address provided")
            }))
        }
    }
}

/// Send on `conn` under `deadline`, then put back the send deadline it had.
fn send_scoped<T: StreamTransport>(
    conn: &mut StreamConn<T>,
    data: &[u8],
    deadline: Option<Instant>,
    retry: Option<RetryPolicy>,
) -> Result<()> {
    let Some(deadline) = deadline else {
        return conn.send(data, retry);
    };
    let previous = conn.send_deadline();
    conn.set_send_deadline(Some(deadline))?;
    let result = conn.send(data, retry);
    let restored = conn.set_send_deadline(previous);
    result?;
    restored
}

/// Idle entry in a per-address pool.
struct PoolEntry<T: StreamTransport> {
    conn: StreamConn<T>,
    last_used: Instant,
}

struct AddrPoolInner<T: StreamTransport> {
    idle: Vec<PoolEntry<T>>,
    stats: PoolStats,
}

/// Pool of idle connections to one address.
struct AddrPool<T: StreamTransport> {
    addr: String,
    config: PoolConfig,
    dialer: Dialer<T>,
    inner: Mutex<AddrPoolInner<T>>,
}

impl<T: StreamTransport> AddrPool<T> {
    fn new(addr: &str, config: PoolConfig, dialer: Dialer<T>) -> Self {
        Self {
            addr: addr.to_string(),
            config,
            dialer,
            inner: Mutex::new(AddrPoolInner {
                idle: Vec::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    /// Open a new connection, bypassing the idle list.
    fn dial(&self) -> Result<StreamConn<T>> {
        let transport = (self.dialer)(&self.addr, self.config.connect_timeout).map_err(|e| {
            warn!(addr = %self.addr, cause = %e, "dial failed");
            NetError::from_io(e)
        })?;
        self.inner.lock().stats.record_dial();
        debug!(addr = %self.addr, "dialed pooled connection");
        Ok(StreamConn::from_transport(transport))
    }

    /// Take the most recently returned idle connection, or dial a new one.
    fn get(&self) -> Result<StreamConn<T>> {
        {
            let mut inner = self.inner.lock();
            let idle_timeout = self.config.idle_timeout;
            let before = inner.idle.len();
            inner.idle.retain(|e| e.last_used.elapsed() <= idle_timeout);
            let expired = before - inner.idle.len();
            if expired > 0 {
                inner.stats.record_expired(expired);
                debug!(addr = %self.addr, expired, "dropped idle connections");
            }

            if let Some(entry) = inner.idle.pop() {
                inner.stats.record_reuse();
                return Ok(entry.conn);
            }
        }

        // Dial without holding the lock.
        self.dial()
    }

    /// Return a healthy connection to the idle list.
    fn put(&self, mut conn: StreamConn<T>) {
        // The next borrower starts without the previous borrower's deadlines.
        if conn.set_deadline(None).is_err() {
            self.discard(conn);
            return;
        }

        let mut inner = self.inner.lock();
        if inner.idle.len() < self.config.max_idle_per_addr {
            inner.idle.push(PoolEntry {
                conn,
                last_used: Instant::now(),
            });
            inner.stats.record_return();
        } else {
            inner.stats.record_discard();
        }
    }

    /// Close a connection that must not be reused.
    fn discard(&self, conn: StreamConn<T>) {
        self.inner.lock().stats.record_discard();
        debug!(addr = %self.addr, "closing pooled connection");
        if let Err(e) = conn.close() {
            debug!(addr = %self.addr, cause = %e, "closing discarded connection failed");
        }
    }

    fn cleanup(&self) -> usize {
        let mut inner = self.inner.lock();
        let idle_timeout = self.config.idle_timeout;
        let before = inner.idle.len();
        inner.idle.retain(|e| e.last_used.elapsed() <= idle_timeout);
        let expired = before - inner.idle.len();
        inner.stats.record_expired(expired);
        expired
    }
}

/// A registry of per-address connection pools.
///
/// Pools are created lazily on the first [`ConnPool::get`] for an address.
/// The registry is an ordinary value: share it through `Arc` or clone it
/// (clones share the same pools).
pub struct ConnPool<T: StreamTransport + Send + 'static = TcpStream> {
    config: PoolConfig,
    dialer: Dialer<T>,
    pools: Arc<RwLock<HashMap<String, Arc<AddrPool<T>>>>>,
}

impl<T: StreamTransport + Send + 'static> Clone for ConnPool<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            dialer: Arc::clone(&self.dialer),
            pools: Arc::clone(&self.pools),
        }
    }
}

impl ConnPool<TcpStream> {
    /// Create a TCP connection pool.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_dialer(config, Arc::new(dial_tcp))
    }

    /// Create a TCP connection pool with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl<T: StreamTransport + Send + 'static> ConnPool<T> {
    /// Create a pool that opens transports through `dialer`.
    pub fn with_dialer(config: PoolConfig, dialer: Dialer<T>) -> Self {
        Self {
            config,
            dialer,
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn addr_pool(&self, addr: &str) -> Arc<AddrPool<T>> {
        if let Some(pool) = self.pools.read().get(addr) {
            return Arc::clone(pool);
        }

        // Checked again under the write lock: a concurrent first caller may
        // have created the pool in between.
        let mut pools = self.pools.write();
        let pool = pools.entry(addr.to_string()).or_insert_with(|| {
            debug!(addr, "created connection pool");
            Arc::new(AddrPool::new(
                addr,
                self.config.clone(),
                Arc::clone(&self.dialer),
            ))
        });
        Arc::clone(pool)
    }

    /// Borrow a connection to `addr`, dialing one if none is idle.
    pub fn get(&self, addr: &str) -> Result<PoolConn<T>> {
        let pool = self.addr_pool(addr);
        let conn = pool.get()?;
        Ok(PoolConn {
            conn: Some(conn),
            pool,
            status: ConnStatus::Unknown,
        })
    }

    /// Number of idle connections for `addr`.
    pub fn idle_count(&self, addr: &str) -> usize {
        self.pools
            .read()
            .get(addr)
            .map_or(0, |pool| pool.inner.lock().idle.len())
    }

    /// Number of idle connections across all addresses.
    pub fn total_idle(&self) -> usize {
        self.pools
            .read()
            .values()
            .map(|pool| pool.inner.lock().idle.len())
            .sum()
    }

    /// Statistics for `addr`, if a pool exists for it.
    pub fn stats(&self, addr: &str) -> Option<PoolStats> {
        self.pools
            .read()
            .get(addr)
            .map(|pool| pool.inner.lock().stats.clone())
    }

    /// Drop idle connections past the idle timeout.
    ///
    /// Returns the number of connections removed.
    pub fn cleanup(&self) -> usize {
        self.pools.read().values().map(|pool| pool.cleanup()).sum()
    }

    /// Drop every pool and its idle connections.
    pub fn clear(&self) {
        self.pools.write().clear();
    }
}

impl<T: StreamTransport + Send + 'static> std::fmt::Debug for ConnPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addresses = self.pools.read().len();
        f.debug_struct("ConnPool")
            .field("addresses", &addresses)
            .field("total_idle", &self.total_idle())
            .finish()
    }
}

/// A connection borrowed from a [`ConnPool`].
///
/// Every operation records whether it succeeded. Closing (or dropping) a
/// connection whose last operation succeeded returns it to the pool; any
/// other connection is shut down.
pub struct PoolConn<T: StreamTransport + Send + 'static = TcpStream> {
    conn: Option<StreamConn<T>>,
    pool: Arc<AddrPool<T>>,
    status: ConnStatus,
}

impl<T: StreamTransport + Send + 'static> PoolConn<T> {
    /// Current health status.
    pub fn status(&self) -> ConnStatus {
        self.status
    }

    /// Address this connection belongs to.
    pub fn addr(&self) -> &str {
        &self.pool.addr
    }

    /// Get the wrapped stream connection.
    pub fn get_ref(&self) -> Option<&StreamConn<T>> {
        self.conn.as_ref()
    }

    fn conn_mut(&mut self) -> Result<&mut StreamConn<T>> {
        self.conn.as_mut().ok_or(NetError::ConnectionClosed)
    }

    /// Run `f` on the wrapped connection and record the outcome.
    fn track<R>(&mut self, f: impl FnOnce(&mut StreamConn<T>) -> Result<R>) -> Result<R> {
        let result = f(self.conn_mut()?);
        self.status = if result.is_ok() {
            ConnStatus::Active
        } else {
            ConnStatus::Error
        };
        result
    }

    /// Send all of `data`.
    ///
    /// If the connection was never used since it left the pool and the send
    /// fails, it is replaced by a fresh connection and the send is tried once
    /// more.
    pub fn send(&mut self, data: &[u8], retry: Option<RetryPolicy>) -> Result<()> {
        self.send_until(data, None, retry)
    }

    /// Send, bounding every attempt (the reconnect one included) by
    /// `deadline` when set.
    fn send_until(
        &mut self,
        data: &[u8],
        deadline: Option<Instant>,
        retry: Option<RetryPolicy>,
    ) -> Result<()> {
        let mut result = send_scoped(self.conn_mut()?, data, deadline, retry);
        if result.is_err() && self.status == ConnStatus::Unknown {
            warn!(addr = %self.pool.addr, "send on pooled connection failed, reconnecting");
            result = match self.pool.dial() {
                Ok(fresh) => {
                    if let Some(stale) = self.conn.replace(fresh) {
                        self.pool.discard(stale);
                    }
                    send_scoped(self.conn_mut()?, data, deadline, retry)
                }
                Err(e) => Err(e),
            };
        }
        self.status = if result.is_ok() {
            ConnStatus::Active
        } else {
            ConnStatus::Error
        };
        result
    }

    /// Receive data; see [`StreamConn::recv`].
    pub fn recv(&mut self, length: isize, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        self.track(|conn| conn.recv(length, retry))
    }

    /// Receive one line without its terminator.
    pub fn recv_line(&mut self, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        self.track(|conn| conn.recv_line(retry))
    }

    /// Receive until the data ends with `delimiter`.
    pub fn recv_till(&mut self, delimiter: &[u8], retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        self.track(|conn| conn.recv_till(delimiter, retry))
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

    /// Send with a timeout.
    pub fn send_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        retry: Option<RetryPolicy>,
    ) -> Result<()> {
        self.send_until(data, Some(Instant::now() + timeout), retry)
    }

    /// Receive with a timeout.
    pub fn recv_with_timeout(
        &mut self,
        length: isize,
        timeout: Duration,
        retry: Option<RetryPolicy>,
    ) -> Result<Vec<u8>> {
        self.track(|conn| conn.recv_with_timeout(length, timeout, retry))
    }

    /// Send `data` and receive the reply within `timeout`.
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

    /// Send one length-prefixed packet, with the same reconnect rule as
    /// [`PoolConn::send`].
    pub fn send_pkg(&mut self, data: &[u8], options: &PkgOptions) -> Result<()> {
        let packet = encode_stream_packet(data, options)?;
        self.send(&packet, options.retry())
    }

    /// Receive one length-prefixed packet.
    pub fn recv_pkg(&mut self, options: &PkgOptions) -> Result<Bytes> {
        self.track(|conn| conn.recv_pkg(options))
    }

    /// Send one packet and receive the reply packet.
    pub fn send_recv_pkg(&mut self, data: &[u8], options: &PkgOptions) -> Result<Bytes> {
        self.send_pkg(data, options)?;
        self.recv_pkg(options)
    }

    /// Send one packet with a timeout.
    pub fn send_pkg_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        options: &PkgOptions,
    ) -> Result<()> {
        let packet = encode_stream_packet(data, options)?;
        self.send_with_timeout(&packet, timeout, options.retry())
    }

    /// Receive one packet with a timeout.
    pub fn recv_pkg_with_timeout(&mut self, timeout: Duration, options: &PkgOptions) -> Result<Bytes> {
        self.track(|conn| conn.recv_pkg_with_timeout(timeout, options))
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

    /// Release the connection: back to the pool when healthy, closed otherwise.
    pub fn close(mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.status.is_reusable() {
                self.pool.put(conn);
            } else {
                self.pool.discard(conn);
            }
        }
    }
}

impl<T: StreamTransport + Send + 'static> Drop for PoolConn<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: StreamTransport + Send + 'static> Connection for PoolConn<T> {
    fn send(&mut self, data: &[u8], retry: Option<RetryPolicy>) -> Result<()> {
        PoolConn::send(self, data, retry)
    }

    fn recv(&mut self, length: isize, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        PoolConn::recv(self, length, retry)
    }

    fn recv_line(&mut self, retry: Option<RetryPolicy>) -> Result<Vec<u8>> {
        PoolConn::recv_line(self, retry)
    }

    fn close(self) -> Result<()> {
        PoolConn::close(self)
    }
}

impl<T: StreamTransport + Send + 'static> std::fmt::Debug for PoolConn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConn")
            .field("addr", &self.pool.addr)
            .field("status", &self.status)
            .finish()
    }
}
