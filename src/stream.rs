//! uTP Stream
//!
//! [`UtpStream`] is the application-facing handle for one connection. All
//! methods take `&self`, so a stream can be shared between a reading and a
//! writing task behind an `Arc`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::conn::Connection;
use crate::error::{Result, UtpError};
use crate::socket::UtpSocket;
use crate::state::{ConnectionState, ConnectionStats};

/// A reliable, ordered byte stream over uTP
pub struct UtpStream {
    conn: Arc<Connection>,
    local_addr: SocketAddr,

    /// Socket created by [`dial`], kept alive until the connection is gone
    owned_socket: Option<UtpSocket>,
}

impl UtpStream {
    pub(crate) fn new(conn: Arc<Connection>, local_addr: SocketAddr) -> Self {
        Self {
            conn,
            local_addr,
            owned_socket: None,
        }
    }

    fn with_socket(mut self, socket: UtpSocket) -> Self {
        self.owned_socket = Some(socket);
        self
    }

    /// Read available bytes; `Ok(0)` means the peer finished sending
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.conn.read(buf).await
    }

    /// Read exactly `buf.len()` bytes
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.conn.read(&mut buf[filled..]).await? {
                0 => {
                    return Err(UtpError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended before buffer was filled",
                    )))
                }
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Write bytes, returning how many were accepted
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.conn.write(buf).await
    }

    /// Write the whole buffer
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.conn.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Finish sending. Buffered data can still be read.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Wait until the connection is fully torn down
    pub async fn closed(&self) {
        self.conn.closed().await;
    }

    /// Set both read and write deadlines; `None` clears them
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.conn.set_read_deadline(at);
        self.conn.set_write_deadline(at);
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.conn.set_read_deadline(at);
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.conn.set_write_deadline(at);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// Get connection state
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }
}

impl Drop for UtpStream {
    fn drop(&mut self) {
        self.conn.close();
        let Some(socket) = self.owned_socket.take() else {
            return;
        };
        // Let the FIN exchange finish before the socket goes away.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let conn = self.conn.clone();
                handle.spawn(async move {
                    conn.closed().await;
                    drop(socket);
                });
            }
            Err(_) => drop(socket),
        }
    }
}

impl std::fmt::Debug for UtpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.conn.remote_addr())
            .field("state", &self.conn.state())
            .finish()
    }
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

async fn dial_owned(addr: SocketAddr, timeout: Option<Duration>) -> Result<UtpStream> {
    let socket = UtpSocket::bind(unspecified_for(&addr)).await?;
    let stream = match timeout {
        Some(timeout) => socket.dial_timeout(addr, timeout).await?,
        None => socket.dial(addr).await?,
    };
    Ok(stream.with_socket(socket))
}

/// Connect from a fresh socket owned by the returned stream
pub async fn dial(addr: SocketAddr) -> Result<UtpStream> {
    dial_owned(addr, None).await
}

/// Like [`dial`], giving up after `timeout`
pub async fn dial_timeout(addr: SocketAddr, timeout: Duration) -> Result<UtpStream> {
    dial_owned(addr, Some(timeout)).await
}

/// Bind a socket for accepting connections
pub async fn listen(addr: SocketAddr) -> Result<UtpSocket> {
    UtpSocket::bind(addr).await
}
