//! Transport liveness layer.
//!
//! Owns the single TCP socket of a client and keeps it usable across
//! requests: `ensure_live` probes the socket before every send and
//! transparently reconnects when the peer is gone or stale bytes are waiting.

use crate::error::{ClientError, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt;
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

/// Host and port of the server under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of the liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing pending and the peer is still there.
    Alive,
    /// Unread bytes are waiting; the peer is still there.
    Pending,
    /// The peer closed its side, or the socket is in an error state.
    Dead,
}

/// A single stream connection to one endpoint.
///
/// `stream` being `Some` is the liveness flag: set on connect, cleared on
/// disconnect.
#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    connect_timeout: Option<Duration>,
}

impl Connection {
    /// Create a connection in the closed state.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            connect_timeout: None,
        }
    }

    /// Bound connect attempts instead of waiting for the OS default.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open a new socket to the endpoint with TCP_NODELAY set.
    ///
    /// Any previously held socket is closed first.
    pub fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let stream = self.open().map_err(|source| ClientError::Connect {
            endpoint: self.endpoint.to_string(),
            source,
        })?;

        debug!(endpoint = %self.endpoint, "Connected");
        self.stream = Some(stream);
        Ok(())
    }

    /// Close the socket if open. Calling it again is a no-op.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(endpoint = %self.endpoint, "Disconnected");
        }
    }

    /// Drop the current socket and open a fresh one.
    pub fn reconnect(&mut self) -> Result<()> {
        info!(endpoint = %self.endpoint, "Reconnecting");
        self.disconnect();
        self.connect()
    }

    /// Make sure the connection is usable before a request is written.
    ///
    /// Opens the socket if it was never opened, and reconnects if the probe
    /// finds the peer gone or unread bytes left over from an earlier reply.
    /// Those bytes would otherwise be read as the reply to the next request.
    pub fn ensure_live(&mut self) -> Result<()> {
        let state = match self.stream.as_ref() {
            None => return self.connect(),
            Some(stream) => probe(stream),
        };
        match state {
            Liveness::Alive => Ok(()),
            Liveness::Pending => {
                debug!(endpoint = %self.endpoint, "Discarding unread bytes pending before send");
                self.reconnect()
            }
            Liveness::Dead => {
                debug!(endpoint = %self.endpoint, "Peer closed the connection");
                self.reconnect()
            }
        }
    }

    /// Borrow the open socket.
    pub fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(ClientError::NotConnected)
    }

    fn open(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.endpoint.host.as_str(), self.endpoint.port).to_socket_addrs()? {
            match self.open_addr(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(ErrorKind::NotFound, "endpoint resolved to no addresses")
        }))
    }

    fn open_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(
            match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            },
            Type::STREAM,
            Some(Protocol::TCP),
        )?;

        socket.set_nodelay(true)?;
        match self.connect_timeout {
            Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
            None => socket.connect(&addr.into())?,
        }

        Ok(socket.into())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Non-blocking single-byte peek.
///
/// EOF means the peer half-closed; would-block means alive with nothing
/// pending. The byte is left in the socket.
pub fn probe(stream: &TcpStream) -> Liveness {
    let sock = SockRef::from(stream);
    let mut byte = [MaybeUninit::<u8>::uninit(); 1];
    match sock.recv_with_flags(&mut byte, libc::MSG_PEEK | libc::MSG_DONTWAIT) {
        Ok(0) => Liveness::Dead,
        Ok(_) => Liveness::Pending,
        Err(e) if e.kind() == ErrorKind::WouldBlock => Liveness::Alive,
        Err(e) if e.kind() == ErrorKind::Interrupted => probe(stream),
        Err(_) => Liveness::Dead,
    }
}
