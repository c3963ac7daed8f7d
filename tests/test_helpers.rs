//! Test Helpers
//!
//! Shared setup for the integration tests: sockets on loopback with short
//! retransmission timers, deterministic payloads, and a transport that
//! duplicates, reorders and drops outgoing datagrams.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gosh_utp::{DatagramTransport, UtpConfig, UtpSocket};
use rand::Rng;
use tokio::net::UdpSocket;

/// Install a tracing subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Configuration with retransmission timers short enough for tests
pub fn fast_config() -> UtpConfig {
    UtpConfig::new()
        .resend_timing(
            Duration::from_millis(100),
            Duration::from_millis(20),
            Duration::from_millis(400),
        )
        .ack_timeout(Duration::from_secs(10))
}

/// Bind a socket on loopback
pub async fn bind_socket() -> UtpSocket {
    UtpSocket::bind_with_config(localhost(), fast_config())
        .await
        .expect("Failed to bind uTP socket")
}

/// Bind a socket on loopback whose outgoing datagrams are mangled
pub async fn bind_lossy_socket(profile: LossProfile) -> UtpSocket {
    let transport = LossyTransport::bind(localhost(), profile)
        .await
        .expect("Failed to bind UDP socket");
    UtpSocket::with_transport(Arc::new(transport), fast_config())
        .expect("Failed to create uTP socket")
}

/// Deterministic test payload
pub fn test_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 251) as u8).collect()
}

/// Probabilities applied to each outgoing datagram
#[derive(Debug, Clone, Copy, Default)]
pub struct LossProfile {
    pub duplicate: f64,
    pub reorder: f64,
    pub drop: f64,
}

impl LossProfile {
    pub fn mild() -> Self {
        Self {
            duplicate: 0.1,
            reorder: 0.1,
            drop: 0.02,
        }
    }
}

/// A UDP transport that duplicates, delays and drops what it sends
pub struct LossyTransport {
    socket: Arc<UdpSocket>,
    profile: LossProfile,
}

impl LossyTransport {
    pub async fn bind(addr: SocketAddr, profile: LossProfile) -> io::Result<Self> {
        Ok(Self {
            socket: Arc::new(UdpSocket::bind(addr).await?),
            profile,
        })
    }
}

#[async_trait]
impl DatagramTransport for LossyTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let (drop, reorder, duplicate, delay_ms) = {
            let mut rng = rand::rng();
            (
                rng.random_bool(self.profile.drop),
                rng.random_bool(self.profile.reorder),
                rng.random_bool(self.profile.duplicate),
                rng.random_range(5..30u64),
            )
        };

        if drop {
            return Ok(buf.len());
        }
        if reorder {
            // Delivered after whatever is sent next
            let socket = self.socket.clone();
            let data = buf.to_vec();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = socket.send_to(&data, addr).await;
            });
            return Ok(buf.len());
        }
        let n = self.socket.send_to(buf, addr).await?;
        if duplicate {
            self.socket.send_to(buf, addr).await?;
        }
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_deterministic() {
        let a = test_payload(1000);
        assert_eq!(a.len(), 1000);
        assert_eq!(a, test_payload(1000));
    }

    #[tokio::test]
    async fn test_lossless_profile_delivers() {
        let transport = LossyTransport::bind(localhost(), LossProfile::default())
            .await
            .unwrap();
        let receiver = UdpSocket::bind(localhost()).await.unwrap();

        transport
            .send_to(b"datagram", receiver.local_addr().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }
}
