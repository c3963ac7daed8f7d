//! uTP configuration
//!
//! All tuning constants of the transport live here and are passed to a
//! socket at construction. None of them is a protocol requirement; the
//! defaults are empirical values that work against libutp peers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UtpError};
use crate::packet::{MAX_HEADER_SIZE, MIN_MTU};

/// What to do with a SYN that arrives while the backlog is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BacklogPolicy {
    /// Reset the oldest pending SYN and queue the new one
    #[default]
    EvictOldest,
    /// Reset the new SYN and keep the queue as is
    RejectNew,
}

impl std::fmt::Display for BacklogPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EvictOldest => write!(f, "evict-oldest"),
            Self::RejectNew => write!(f, "reject-new"),
        }
    }
}

impl std::str::FromStr for BacklogPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "evict-oldest" | "evict" => Ok(Self::EvictOldest),
            "reject-new" | "reject" => Ok(Self::RejectNew),
            _ => Err(format!("Invalid backlog policy: {}", s)),
        }
    }
}

/// uTP socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtpConfig {
    /// Largest payload carried by one DATA packet (bytes)
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// Receive buffer budget advertised to the peer (bytes)
    #[serde(default = "default_recv_window")]
    pub recv_window: u32,

    /// Maximum SYNs waiting for `accept`
    #[serde(default = "default_backlog")]
    pub backlog: usize,

    /// Behaviour when the backlog is full
    #[serde(default)]
    pub backlog_policy: BacklogPolicy,

    /// Maximum out-of-order packets buffered ahead of `ack_nr`.
    /// 64 matches the 8-byte selective ack bitmask.
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,

    /// Maximum segments in flight before `write` blocks
    #[serde(default = "default_max_unacked_sends")]
    pub max_unacked_sends: usize,

    /// Initial retransmission delay in milliseconds
    #[serde(default = "default_resend_delay_ms")]
    pub resend_delay_ms: u64,

    /// Random jitter applied around each retransmission delay (ms)
    #[serde(default = "default_resend_jitter_ms")]
    pub resend_jitter_ms: u64,

    /// Cap for the doubling retransmission delay (ms)
    #[serde(default = "default_max_resend_delay_ms")]
    pub max_resend_delay_ms: u64,

    /// A segment unacked this long after its first send kills the connection (ms)
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Skipped selective-ack counts that trigger a fast resend
    #[serde(default = "default_fast_resend_thresholds")]
    pub fast_resend_thresholds: Vec<u32>,

    /// Queued non-uTP datagrams before new ones are dropped
    #[serde(default = "default_passthrough_queue")]
    pub passthrough_queue: usize,

    /// Probability of silently dropping an outgoing packet (testing only)
    #[serde(default)]
    pub packet_drop_chance: f64,
}

fn default_max_payload_size() -> usize {
    MIN_MTU - MAX_HEADER_SIZE
}

fn default_recv_window() -> u32 {
    0x8000 // 32 KiB
}

fn default_backlog() -> usize {
    50
}

fn default_reorder_window() -> usize {
    64
}

fn default_max_unacked_sends() -> usize {
    64
}

fn default_resend_delay_ms() -> u64 {
    3000
}

fn default_resend_jitter_ms() -> u64 {
    1000
}

fn default_max_resend_delay_ms() -> u64 {
    12_000
}

fn default_ack_timeout_ms() -> u64 {
    15_000
}

fn default_fast_resend_thresholds() -> Vec<u32> {
    vec![3, 60]
}

fn default_passthrough_queue() -> usize {
    100
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
            recv_window: default_recv_window(),
            backlog: default_backlog(),
            backlog_policy: BacklogPolicy::default(),
            reorder_window: default_reorder_window(),
            max_unacked_sends: default_max_unacked_sends(),
            resend_delay_ms: default_resend_delay_ms(),
            resend_jitter_ms: default_resend_jitter_ms(),
            max_resend_delay_ms: default_max_resend_delay_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            fast_resend_thresholds: default_fast_resend_thresholds(),
            passthrough_queue: default_passthrough_queue(),
            packet_drop_chance: 0.0,
        }
    }
}

impl UtpConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum payload per packet
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the advertised receive window budget
    pub fn recv_window(mut self, bytes: u32) -> Self {
        self.recv_window = bytes;
        self
    }

    /// Set the backlog capacity
    pub fn backlog(mut self, capacity: usize) -> Self {
        self.backlog = capacity;
        self
    }

    /// Set the backlog overflow policy
    pub fn backlog_policy(mut self, policy: BacklogPolicy) -> Self {
        self.backlog_policy = policy;
        self
    }

    /// Set the out-of-order reassembly window (packets)
    pub fn reorder_window(mut self, packets: usize) -> Self {
        self.reorder_window = packets;
        self
    }

    /// Set the maximum number of segments in flight
    pub fn max_unacked_sends(mut self, segments: usize) -> Self {
        self.max_unacked_sends = segments;
        self
    }

    /// Set the retransmission schedule
    pub fn resend_timing(mut self, initial: Duration, jitter: Duration, max: Duration) -> Self {
        self.resend_delay_ms = initial.as_millis() as u64;
        self.resend_jitter_ms = jitter.as_millis() as u64;
        self.max_resend_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set the absolute ack ceiling
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the fast resend thresholds
    pub fn fast_resend_thresholds(mut self, thresholds: Vec<u32>) -> Self {
        self.fast_resend_thresholds = thresholds;
        self
    }

    /// Set the artificial packet drop probability
    pub fn packet_drop_chance(mut self, chance: f64) -> Self {
        self.packet_drop_chance = chance;
        self
    }

    pub fn resend_delay(&self) -> Duration {
        Duration::from_millis(self.resend_delay_ms)
    }

    pub fn resend_jitter(&self) -> Duration {
        Duration::from_millis(self.resend_jitter_ms)
    }

    pub fn max_resend_delay(&self) -> Duration {
        Duration::from_millis(self.max_resend_delay_ms)
    }

    pub fn ack_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_size == 0 || self.max_payload_size + MAX_HEADER_SIZE > u16::MAX as usize
        {
            return Err(UtpError::invalid_config(
                "max_payload_size",
                "Must be between 1 and 65505",
            ));
        }

        if self.recv_window == 0 {
            return Err(UtpError::invalid_config("recv_window", "Must be at least 1"));
        }

        if self.backlog == 0 {
            return Err(UtpError::invalid_config("backlog", "Must be at least 1"));
        }

        // The selective ack bitmask covers 64 packets past ack_nr + 1.
        if self.reorder_window == 0 || self.reorder_window > 65 {
            return Err(UtpError::invalid_config(
                "reorder_window",
                "Must be between 1 and 65",
            ));
        }

        if self.max_unacked_sends == 0 {
            return Err(UtpError::invalid_config(
                "max_unacked_sends",
                "Must be at least 1",
            ));
        }

        if self.resend_delay_ms == 0 || self.resend_jitter_ms >= self.resend_delay_ms {
            return Err(UtpError::invalid_config(
                "resend_jitter_ms",
                "Jitter must be smaller than a non-zero resend delay",
            ));
        }

        if self.max_resend_delay_ms < self.resend_delay_ms {
            return Err(UtpError::invalid_config(
                "max_resend_delay_ms",
                "Must be >= resend_delay_ms",
            ));
        }

        if self.passthrough_queue == 0 {
            return Err(UtpError::invalid_config(
                "passthrough_queue",
                "Must be at least 1",
            ));
        }

        if !(0.0..1.0).contains(&self.packet_drop_chance) {
            return Err(UtpError::invalid_config(
                "packet_drop_chance",
                "Must be in [0, 1)",
            ));
        }

        Ok(())
    }
}
