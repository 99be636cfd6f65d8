//! Stream and datagram servers.
//!
//! A [`TcpServer`] accepts connections on one listening socket and hands each
//! one, wrapped as a [`StreamConn`], to its handler on a new thread. A
//! [`UdpServer`] binds one socket and hands it, wrapped as a
//! [`DatagramConn`], to its handler once.
//!
//! # Example
//!
//! ```no_run
//! use pktconn::{PkgOptions, StreamConn, TcpServer};
//! use std::sync::Arc;
//!
//! let server = TcpServer::new("127.0.0.1:9000", Arc::new(|mut conn: StreamConn| {
//!     let options = PkgOptions::default();
//!     while let Ok(data) = conn.recv_pkg(&options) {
//!         if conn.send_pkg(&data, &options).is_err() {
//!             break;
//!         }
//!     }
//! }));
//! server.run().unwrap();
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::error::{NetError, Result};
use crate::transport::{DatagramConn, StreamConn};

/// Address used by servers created without one.
pub const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0:0";

/// Handler invoked with every accepted stream connection.
pub type StreamHandler = Arc<dyn Fn(StreamConn) + Send + Sync>;

/// Handler invoked with the bound datagram socket.
pub type DatagramHandler = Arc<dyn Fn(DatagramConn) + Send + Sync>;

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Configured but not bound.
    Created,
    /// Bound and accepting.
    Listening,
    /// Closed; cannot be restarted.
    Closed,
}

/// Map a wildcard listen address to a loopback address reachable from here.
fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, addr.port()).into(),
        _ => addr,
    }
}

/// A stream server.
///
/// All methods take `&self`, so a server can be shared through `Arc` and
/// closed from another thread while [`TcpServer::serve`] blocks.
pub struct TcpServer {
    address: RwLock<String>,
    handler: RwLock<Option<StreamHandler>>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<ServerState>,
    closed: AtomicBool,
}

impl TcpServer {
    /// Create a server for `address` with a connection handler.
    pub fn new(address: impl Into<String>, handler: StreamHandler) -> Self {
        let server = Self::with_address(address);
        server.set_handler(handler);
        server
    }

    /// Create a server without a handler.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: RwLock::new(address.into()),
            handler: RwLock::new(None),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            state: Mutex::new(ServerState::Created),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the listen address. Takes effect on the next [`TcpServer::listen`].
    pub fn set_address(&self, address: impl Into<String>) {
        *self.address.write() = address.into();
    }

    /// Set the connection handler.
    pub fn set_handler(&self, handler: StreamHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Configured listen address.
    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    /// Address actually bound, once listening.
    pub fn listened_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Bind the listening socket.
    ///
    /// Fails with [`NetError::NoHandler`] before binding anything when no
    /// handler is set.
    pub fn listen(&self) -> Result<()> {
        if self.handler.read().is_none() {
            return Err(NetError::NoHandler);
        }

        let mut state = self.state.lock();
        if *state != ServerState::Created {
            return Err(NetError::InvalidState(format!(
                "cannot listen in state {:?}",
                *state
            )));
        }

        let address = self.address();
        let listener = TcpListener::bind(&address).map_err(|e| {
            error!(address = %address, cause = %e, "tcp server bind failed");
            NetError::from_io(e)
        })?;
        let local_addr = listener.local_addr()?;

        *self.listener.lock() = Some(Arc::new(listener));
        *self.local_addr.lock() = Some(local_addr);
        *state = ServerState::Listening;
        info!(address = %local_addr, "tcp server listening");
        Ok(())
    }

    /// Accept connections until the server is closed or accepting fails.
    ///
    /// Each connection is handled on its own thread.
    pub fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .clone()
            .ok_or_else(|| NetError::InvalidState("server is not listening".to_string()))?;
        let handler = self.handler.read().clone().ok_or(NetError::NoHandler)?;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    debug!(peer = %peer, "accepted connection");
                    let handler = Arc::clone(&handler);
                    thread::spawn(move || handler(StreamConn::from_transport(stream)));
                }
                Err(_) if self.closed.load(Ordering::SeqCst) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(cause = %e, "tcp server accept failed");
                    return Err(NetError::from_io(e));
                }
            }
        }
    }

    /// Listen and serve on the current thread.
    pub fn run(&self) -> Result<()> {
        self.listen()?;
        self.serve()
    }

    /// Close the server.
    ///
    /// A blocked [`TcpServer::serve`] returns `Ok(())`. Connections already
    /// handed to the handler stay open. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ServerState::Closed {
            return Ok(());
        }
        let was_listening = *state == ServerState::Listening;
        *state = ServerState::Closed;
        self.closed.store(true, Ordering::SeqCst);
        drop(state);

        if was_listening {
            if let Some(addr) = self.listened_addr() {
                // Wake the accept loop so it sees the closed flag.
                if let Err(e) = TcpStream::connect(reachable(addr)) {
                    debug!(address = %addr, cause = %e, "wake connection failed");
                }
                info!(address = %addr, "tcp server closed");
            }
        }
        self.listener.lock().take();
        Ok(())
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("address", &self.address())
            .field("listened_addr", &self.listened_addr())
            .field("state", &self.state())
            .finish()
    }
}

/// A datagram server.
pub struct UdpServer {
    address: RwLock<String>,
    handler: RwLock<Option<DatagramHandler>>,
    socket: Mutex<Option<UdpSocket>>,
    control: Mutex<Option<UdpSocket>>,
    local_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<ServerState>,
}

impl UdpServer {
    /// Create a server for `address` with a handler.
    pub fn new(address: impl Into<String>, handler: DatagramHandler) -> Self {
        let server = Self::with_address(address);
        server.set_handler(handler);
        server
    }

    /// Create a server without a handler.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: RwLock::new(address.into()),
            handler: RwLock::new(None),
            socket: Mutex::new(None),
            control: Mutex::new(None),
            local_addr: Mutex::new(None),
            state: Mutex::new(ServerState::Created),
        }
    }

    /// Set the bind address. Takes effect on the next [`UdpServer::listen`].
    pub fn set_address(&self, address: impl Into<String>) {
        *self.address.write() = address.into();
    }

    /// Set the handler.
    pub fn set_handler(&self, handler: DatagramHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Configured bind address.
    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    /// Address actually bound, once listening.
    pub fn listened_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Bind the socket.
    pub fn listen(&self) -> Result<()> {
        if self.handler.read().is_none() {
            return Err(NetError::NoHandler);
        }

        let mut state = self.state.lock();
        if *state != ServerState::Created {
            return Err(NetError::InvalidState(format!(
                "cannot listen in state {:?}",
                *state
            )));
        }

        let address = self.address();
        let socket = UdpSocket::bind(&address).map_err(|e| {
            error!(address = %address, cause = %e, "udp server bind failed");
            NetError::from_io(e)
        })?;
        let local_addr = socket.local_addr()?;
        let control = socket.try_clone()?;

        *self.socket.lock() = Some(socket);
        *self.control.lock() = Some(control);
        *self.local_addr.lock() = Some(local_addr);
        *state = ServerState::Listening;
        info!(address = %local_addr, "udp server listening");
        Ok(())
    }

    /// Run the handler with the bound socket on the current thread.
    ///
    /// Returns when the handler returns.
    pub fn serve(&self) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .take()
            .ok_or_else(|| NetError::InvalidState("server is not listening".to_string()))?;
        let handler = self.handler.read().clone().ok_or(NetError::NoHandler)?;
        handler(DatagramConn::from_transport(socket, None));
        Ok(())
    }

    /// Listen and serve on the current thread.
    pub fn run(&self) -> Result<()> {
        self.listen()?;
        self.serve()
    }

    /// Close the server.
    ///
    /// Receives on the handler's connection that have no deadline of their
    /// own start failing with [`NetError::Timeout`], which ends a typical
    /// receive loop. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ServerState::Closed {
            return Ok(());
        }
        *state = ServerState::Closed;
        drop(state);

        self.socket.lock().take();
        if let Some(control) = self.control.lock().take() {
            control.set_read_timeout(Some(Duration::from_micros(1)))?;
            if let Some(addr) = self.listened_addr() {
                // Unblock a receive already waiting on the socket.
                if let Err(e) = control.send_to(&[], reachable(addr)) {
                    debug!(address = %addr, cause = %e, "wake datagram failed");
                }
                info!(address = %addr, "udp server closed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("address", &self.address())
            .field("listened_addr", &self.listened_addr())
            .field("state", &self.state())
            .finish()
    }
}

/// Named stream servers.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Arc<TcpServer>>>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the server registered as `name`, creating an unconfigured one on
    /// [`DEFAULT_SERVER_ADDRESS`] if there is none.
    pub fn get_or_create(&self, name: &str) -> Arc<TcpServer> {
        if let Some(server) = self.servers.read().get(name) {
            return Arc::clone(server);
        }
        let mut servers = self.servers.write();
        let server = servers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TcpServer::with_address(DEFAULT_SERVER_ADDRESS)));
        Arc::clone(server)
    }

    /// Register `server` as `name`, returning the server it replaced.
    pub fn insert(&self, name: &str, server: Arc<TcpServer>) -> Option<Arc<TcpServer>> {
        self.servers.write().insert(name.to_string(), server)
    }

    /// Get the server registered as `name`.
    pub fn get(&self, name: &str) -> Option<Arc<TcpServer>> {
        self.servers.read().get(name).cloned()
    }

    /// Remove the server registered as `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<TcpServer>> {
        self.servers.write().remove(name)
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    /// Check if no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}
