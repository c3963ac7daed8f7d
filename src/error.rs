//! Typed error hierarchy for gosh-utp
//!
//! Every failure is scoped to one connection or one `dial`/`accept` call.
//! Malformed datagrams never reach the application: the socket treats them
//! as foreign traffic and hands them to the passthrough sink.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for uTP operations
#[derive(Debug, Error)]
pub enum UtpError {
    /// Datagram is not a uTP packet (too short, bad version/type, truncated extensions)
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Read or write deadline exceeded
    #[error("i/o timeout")]
    Timeout,

    /// No STATE reply to our SYN within the dial timeout
    #[error("Dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// Remote sent RESET, or the local socket went away
    #[error("peer reset")]
    PeerReset,

    /// A segment exhausted its retransmissions
    #[error("timed out waiting for ack")]
    AckTimeout,

    /// Write after local close or after the peer finished
    #[error("write on closed pipe")]
    ClosedPipe,

    /// Every connection id towards the remote address is taken
    #[error("No room for a new connection to this address")]
    NoRoomForConnection,

    /// Backlog of pending SYNs is at capacity
    #[error("Backlog full (capacity: {capacity})")]
    BacklogFull { capacity: usize },

    /// The owning socket has been closed
    #[error("Socket closed")]
    SocketClosed,

    /// Rejected configuration value
    #[error("Invalid config for '{field}': {message}")]
    InvalidConfig {
        field: &'static str,
        message: String,
    },

    /// Error from the underlying datagram transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UtpError {
    /// Create an invalid header error
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader(message.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            message: message.into(),
        }
    }

    /// Check if this error is a deadline or dial timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::DialTimeout(_) | Self::AckTimeout)
    }

    /// Check if the caller may retry the same operation on the same object.
    ///
    /// Only deadline timeouts leave the connection usable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if this error terminated the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PeerReset | Self::AckTimeout | Self::SocketClosed)
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::InvalidHeader(_) => io::ErrorKind::InvalidData,
            Self::Timeout | Self::DialTimeout(_) | Self::AckTimeout => io::ErrorKind::TimedOut,
            Self::PeerReset => io::ErrorKind::ConnectionReset,
            Self::ClosedPipe => io::ErrorKind::BrokenPipe,
            Self::NoRoomForConnection => io::ErrorKind::AddrInUse,
            Self::BacklogFull { .. } => io::ErrorKind::ConnectionRefused,
            Self::SocketClosed => io::ErrorKind::NotConnected,
            Self::InvalidConfig { .. } => io::ErrorKind::InvalidInput,
            Self::Io(e) => e.kind(),
        }
    }

    /// Duplicate an error for a second observer.
    ///
    /// A destroyed connection reports the same terminal error to every
    /// subsequent read and write; `io::Error` is not `Clone`, so the
    /// transport variant is rebuilt from its kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::InvalidHeader(m) => Self::InvalidHeader(m.clone()),
            Self::Timeout => Self::Timeout,
            Self::DialTimeout(d) => Self::DialTimeout(*d),
            Self::PeerReset => Self::PeerReset,
            Self::AckTimeout => Self::AckTimeout,
            Self::ClosedPipe => Self::ClosedPipe,
            Self::NoRoomForConnection => Self::NoRoomForConnection,
            Self::BacklogFull { capacity } => Self::BacklogFull {
                capacity: *capacity,
            },
            Self::SocketClosed => Self::SocketClosed,
            Self::InvalidConfig { field, message } => Self::InvalidConfig {
                field: *field,
                message: message.clone(),
            },
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Result type alias for uTP operations
pub type Result<T> = std::result::Result<T, UtpError>;

impl From<UtpError> for io::Error {
    fn from(err: UtpError) -> Self {
        match err {
            UtpError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(UtpError::Timeout.is_timeout());
        assert!(UtpError::Timeout.is_retryable());
        assert!(UtpError::DialTimeout(Duration::from_millis(10)).is_timeout());
        assert!(!UtpError::DialTimeout(Duration::from_millis(10)).is_retryable());
        assert!(!UtpError::PeerReset.is_timeout());
        assert!(UtpError::PeerReset.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: io::Error = UtpError::Timeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err: io::Error = UtpError::ClosedPipe.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err: io::Error = UtpError::PeerReset.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), "peer reset");
    }

    #[test]
    fn test_duplicate_preserves_io_kind() {
        let err = UtpError::Io(io::Error::new(io::ErrorKind::AddrNotAvailable, "gone"));
        let dup = err.duplicate();
        match dup {
            UtpError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::AddrNotAvailable),
            other => panic!("unexpected {:?}", other),
        }
    }
}
