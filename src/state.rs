//! uTP Connection State
//!
//! This module defines the states a uTP connection can be in, the
//! bookkeeping records for segments in flight and out-of-order arrivals,
//! and per-connection counters.

use tokio::time::Instant;

use crate::packet::PacketType;
use crate::time::Alarm;

/// uTP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// SYN sent, waiting for the STATE reply (initiator)
    SynSent,

    /// Connection established, data transfer active
    Connected,

    /// Peer's FIN received and all data before it delivered
    GotFin,

    /// Our FIN sent, waiting for it to be acknowledged
    SentFin,

    /// Torn down; no more packets are handled
    Destroyed,
}

impl ConnectionState {
    /// Check if the connection is in a state where data can be written
    pub fn can_send_data(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if no more data will ever arrive
    pub fn read_finished(&self) -> bool {
        matches!(self, Self::GotFin | Self::Destroyed)
    }

    /// Check if the connection is torn down
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Check if one side has started closing
    pub fn is_finishing(&self) -> bool {
        matches!(self, Self::GotFin | Self::SentFin)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SynSent => write!(f, "SYN_SENT"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::GotFin => write!(f, "GOT_FIN"),
            Self::SentFin => write!(f, "SENT_FIN"),
            Self::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// A segment sent but not yet acknowledged
#[derive(Debug)]
pub struct SendRecord {
    /// Packet type (DATA, SYN or FIN)
    pub packet_type: PacketType,

    /// Connection id the packet is sent on
    pub connection_id: u16,

    /// Sequence number
    pub seq_nr: u16,

    /// Payload, kept for retransmission
    pub payload: Vec<u8>,

    /// Time the segment was first sent
    pub first_sent: Instant,

    /// Set once the peer acknowledged the segment
    pub acked: bool,

    /// Selective acks that reported this segment missing
    pub acks_skipped: u32,

    /// Number of retransmissions
    pub resends: u32,

    /// Retransmission timer
    pub timer: Alarm,
}

impl SendRecord {
    pub fn new(packet_type: PacketType, connection_id: u16, seq_nr: u16, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            connection_id,
            seq_nr,
            payload,
            first_sent: Instant::now(),
            acked: false,
            acks_skipped: 0,
            resends: 0,
            timer: Alarm::new(),
        }
    }

    /// Mark acknowledged: the timer is disarmed and the payload released
    /// in the same step, so a racing timer finds nothing to resend.
    pub fn ack(&mut self) {
        if self.acked {
            return;
        }
        self.acked = true;
        self.timer.disarm();
        self.payload = Vec::new();
    }

    /// Bytes this record occupies in the peer's window
    pub fn window_bytes(&self) -> usize {
        if self.acked {
            0
        } else {
            self.payload.len()
        }
    }
}

/// One slot of the out-of-order reassembly buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundSlot {
    /// Whether the packet for this slot has arrived
    pub seen: bool,

    /// Payload of the packet
    pub data: Vec<u8>,
}

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets sent, including retransmissions and acks
    pub packets_sent: u64,

    /// Packets delivered to the connection
    pub packets_received: u64,

    /// Payload bytes accepted by `write`
    pub bytes_sent: u64,

    /// Payload bytes delivered in order
    pub bytes_received: u64,

    /// Timer-driven retransmissions
    pub resends: u64,

    /// Retransmissions triggered by selective acks
    pub fast_resends: u64,

    /// Inbound packets already received
    pub duplicates: u64,

    /// Inbound packets too far ahead of the reassembly window
    pub out_of_window: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn record_written(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self) {
        self.packets_received += 1;
    }

    pub fn record_delivered(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_predicates() {
        let state = ConnectionState::SynSent;
        assert!(!state.can_send_data());
        assert!(!state.read_finished());

        let state = ConnectionState::Connected;
        assert!(state.can_send_data());
        assert!(!state.is_closed());

        let state = ConnectionState::GotFin;
        assert!(!state.can_send_data());
        assert!(state.read_finished());
        assert!(state.is_finishing());

        let state = ConnectionState::Destroyed;
        assert!(state.is_closed());
        assert_eq!(state.to_string(), "DESTROYED");
    }

    #[tokio::test]
    async fn test_send_record_ack() {
        let mut rec = SendRecord::new(PacketType::Data, 7, 100, vec![1, 2, 3]);
        rec.timer.arm(std::time::Duration::from_secs(60), |_| {});
        assert_eq!(rec.window_bytes(), 3);

        rec.ack();
        assert!(rec.acked);
        assert!(!rec.timer.is_armed());
        assert_eq!(rec.window_bytes(), 0);
    }

    #[test]
    fn test_connection_stats() {
        let mut stats = ConnectionStats::new();
        stats.record_sent();
        stats.record_written(100);
        stats.record_received();
        stats.record_delivered(200);

        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 200);
    }
}
