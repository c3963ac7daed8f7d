//! # gosh-utp
//!
//! The Micro Transport Protocol (uTP, BEP 29) for Tokio: reliable, ordered
//! byte streams over UDP.
//!
//! ## Features
//!
//! - **Multiplexed**: Any number of connections share one UDP socket
//! - **Reliable**: Retransmission with backoff, selective acks and fast resend
//! - **Shared port**: Datagrams that are not uTP are handed back through a
//!   packet-oriented passthrough, so a DHT can run on the same port
//! - **Pluggable transport**: Runs over any [`DatagramTransport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gosh_utp::{dial, listen};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = listen("127.0.0.1:0".parse()?).await?;
//!     let addr = listener.local_addr();
//!
//!     tokio::spawn(async move {
//!         let stream = listener.accept().await?;
//!         let mut buf = [0u8; 5];
//!         stream.read_exact(&mut buf).await?;
//!         stream.write_all(&buf).await?;
//!         Ok::<_, gosh_utp::UtpError>(())
//!     });
//!
//!     let stream = dial(addr).await?;
//!     stream.write_all(b"hello").await?;
//!     let mut buf = [0u8; 5];
//!     stream.read_exact(&mut buf).await?;
//!     assert_eq!(&buf, b"hello");
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
mod conn;
pub mod error;
pub mod packet;
pub mod socket;
pub mod state;
pub mod stream;
pub mod time;
pub mod transport;

// Re-exports for convenience
pub use config::{BacklogPolicy, UtpConfig};
pub use error::{Result, UtpError};
pub use packet::{Header, Packet, PacketType};
pub use socket::{SocketStats, UtpSocket};
pub use state::{ConnectionState, ConnectionStats};
pub use stream::{dial, dial_timeout, listen, UtpStream};
pub use transport::{DatagramTransport, PassthroughConn};
