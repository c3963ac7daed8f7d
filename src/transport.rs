//! Datagram Transport Abstraction
//!
//! A uTP socket runs on top of anything that can send and receive addressed
//! datagrams. The default is a tokio `UdpSocket`; tests and embedders can
//! supply their own, and datagrams that are not uTP are handed back through
//! a [`PassthroughConn`] so the same port can serve other protocols (DHT).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Result, UtpError};

/// Trait for unreliable datagram transports
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to `addr`
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, returning its length and sender
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Get the local address
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// A datagram that was not consumed by uTP
pub type RawDatagram = (Vec<u8>, SocketAddr);

/// Packet-oriented view of the datagrams a uTP socket did not recognise.
///
/// Reads yield foreign datagrams in arrival order; writes go straight to the
/// shared transport. Handles are cheap to clone and share one queue.
#[derive(Clone)]
pub struct PassthroughConn {
    transport: Arc<dyn DatagramTransport>,
    rx: Arc<Mutex<mpsc::Receiver<RawDatagram>>>,
}

impl PassthroughConn {
    pub(crate) fn new(
        transport: Arc<dyn DatagramTransport>,
        rx: Arc<Mutex<mpsc::Receiver<RawDatagram>>>,
    ) -> Self {
        Self { transport, rx }
    }

    /// Receive the next non-uTP datagram.
    ///
    /// Datagrams longer than `buf` are truncated. Fails with
    /// [`UtpError::SocketClosed`] once the socket is closed and the queue
    /// drained.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (data, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(UtpError::SocketClosed)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }

    /// Send a datagram through the shared transport
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.transport.send_to(buf, addr).await?)
    }

    /// Get the local address of the shared transport
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }
}

impl std::fmt::Debug for PassthroughConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughConn")
            .field("local_addr", &self.transport.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a: Arc<dyn DatagramTransport> = Arc::new(a);

        let b_addr = b.local_addr().unwrap();
        a.send_to(b"ping", b_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_passthrough_reads_queue() {
        let udp: Arc<dyn DatagramTransport> =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::channel(4);
        let conn = PassthroughConn::new(udp, Arc::new(Mutex::new(rx)));

        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        tx.send((b"hello world".to_vec(), from)).await.unwrap();
        drop(tx);

        let mut buf = [0u8; 5];
        let (n, addr) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(addr, from);

        assert!(matches!(
            conn.recv_from(&mut buf).await,
            Err(UtpError::SocketClosed)
        ));
    }
}
