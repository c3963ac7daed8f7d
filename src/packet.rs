//! uTP Packet Encoding/Decoding (BEP 29)
//!
//! A uTP packet is a fixed 20-byte header, a chain of extensions and the
//! payload. Each extension starts with the type of the *next* extension, the
//! first type being carried in byte 1 of the header; type 0 ends the chain.

use crate::error::{Result, UtpError};

/// uTP fixed header size
pub const HEADER_SIZE: usize = 20;

/// Smallest datagram size assumed to cross any path unfragmented
pub const MIN_MTU: usize = 576;

/// Header size of every packet we emit: 20 fixed bytes, 2 bytes of
/// extension framing and an 8-byte selective ack
pub const MAX_HEADER_SIZE: usize = HEADER_SIZE + 2 + SELECTIVE_ACK_BYTES;

/// Default maximum payload size per packet
pub const MAX_PAYLOAD_SIZE: usize = MIN_MTU - MAX_HEADER_SIZE;

/// Largest datagram the socket reader accepts
pub const MAX_RECV_SIZE: usize = 0x2000;

/// uTP protocol version
pub const UTP_VERSION: u8 = 1;

/// Selective ack bitmask length we always send
pub const SELECTIVE_ACK_BYTES: usize = 8;

/// Packet type values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet
    Data = 0,
    /// Connection teardown
    Fin = 1,
    /// Acknowledgment (no payload)
    State = 2,
    /// Connection reset
    Reset = 3,
    /// Connection initiation
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = UtpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Fin),
            2 => Ok(Self::State),
            3 => Ok(Self::Reset),
            4 => Ok(Self::Syn),
            _ => Err(UtpError::invalid_header(format!(
                "Invalid packet type: {}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "ST_DATA"),
            Self::Fin => write!(f, "ST_FIN"),
            Self::State => write!(f, "ST_STATE"),
            Self::Reset => write!(f, "ST_RESET"),
            Self::Syn => write!(f, "ST_SYN"),
        }
    }
}

/// Extension type values
pub mod extension {
    /// End of the extension chain
    pub const NONE: u8 = 0;
    /// Selective ACK bitmask
    pub const SELECTIVE_ACK: u8 = 1;
}

/// One entry of the extension chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Extension type (never 0)
    pub kind: u8,
    /// Raw extension bytes
    pub data: Vec<u8>,
}

impl Extension {
    pub fn new(kind: u8, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    /// Interpret this extension as a selective ack, if it is one
    pub fn as_selective_ack(&self) -> Option<SelectiveAck<'_>> {
        (self.kind == extension::SELECTIVE_ACK).then(|| SelectiveAck::new(&self.data))
    }
}

/// Read-only view of a selective ACK bitmask.
///
/// Bit `i` (least significant bit first within each byte) reports that
/// `ack_nr + 2 + i` has been received.
#[derive(Debug, Clone, Copy)]
pub struct SelectiveAck<'a> {
    bitmask: &'a [u8],
}

impl<'a> SelectiveAck<'a> {
    pub fn new(bitmask: &'a [u8]) -> Self {
        Self { bitmask }
    }

    /// Number of packets described by the bitmask
    pub fn num_bits(&self) -> usize {
        self.bitmask.len() * 8
    }

    /// Check if the packet at `index` (relative to ack_nr + 2) is acknowledged
    pub fn is_acked(&self, index: usize) -> bool {
        match self.bitmask.get(index / 8) {
            Some(byte) => (byte >> (index % 8)) & 1 == 1,
            None => false,
        }
    }

    /// Index of the highest acknowledged packet
    pub fn highest_acked(&self) -> Option<usize> {
        (0..self.num_bits()).rev().find(|&i| self.is_acked(i))
    }
}

/// Builder for a selective ACK bitmask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectiveAckBuilder {
    bitmask: Vec<u8>,
}

impl Default for SelectiveAckBuilder {
    fn default() -> Self {
        Self {
            bitmask: vec![0; SELECTIVE_ACK_BYTES],
        }
    }
}

impl SelectiveAckBuilder {
    /// Mark the packet at `index` (relative to ack_nr + 2) as received.
    /// Indices beyond the bitmask are ignored.
    pub fn set_acked(&mut self, index: usize) {
        if let Some(byte) = self.bitmask.get_mut(index / 8) {
            *byte |= 1 << (index % 8);
        }
    }

    pub fn into_extension(self) -> Extension {
        Extension::new(extension::SELECTIVE_ACK, self.bitmask)
    }
}

/// uTP packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Packet type (4 bits, combined with the version on the wire)
    pub packet_type: PacketType,

    /// Connection ID (identifies the connection)
    pub connection_id: u16,

    /// Sender's microsecond timestamp
    pub timestamp_us: u32,

    /// Sender's last measured one-way delay
    pub timestamp_diff_us: u32,

    /// Receive window size (in bytes)
    pub wnd_size: u32,

    /// Sequence number
    pub seq_nr: u16,

    /// Acknowledgment number (last received seq_nr)
    pub ack_nr: u16,

    /// Extension chain, in wire order
    pub extensions: Vec<Extension>,
}

impl Header {
    /// Create a new header without timestamps, window or extensions
    pub fn new(packet_type: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            connection_id,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
            extensions: Vec::new(),
        }
    }

    /// Create a RESET header in reply to a packet
    pub fn reset(connection_id: u16, ack_nr: u16) -> Self {
        Self::new(PacketType::Reset, connection_id, 0, ack_nr)
    }

    /// Set timestamps
    pub fn with_timestamps(mut self, timestamp_us: u32, timestamp_diff_us: u32) -> Self {
        self.timestamp_us = timestamp_us;
        self.timestamp_diff_us = timestamp_diff_us;
        self
    }

    /// Set window size
    pub fn with_window(mut self, wnd_size: u32) -> Self {
        self.wnd_size = wnd_size;
        self
    }

    /// Append an extension
    pub fn with_extension(mut self, ext: Extension) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Encoded length of this header including extensions
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.extensions.iter().map(|e| 2 + e.data.len()).sum::<usize>()
    }

    /// First selective ack extension, if any
    pub fn selective_ack(&self) -> Option<SelectiveAck<'_>> {
        self.extensions.iter().find_map(Extension::as_selective_ack)
    }

    /// Encode the header to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let first_ext = self
            .extensions
            .first()
            .map_or(extension::NONE, |e| e.kind);

        // Byte 0: type (4 bits) | version (4 bits)
        buf.push((self.packet_type as u8) << 4 | UTP_VERSION);
        buf.push(first_ext);
        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_diff_us.to_be_bytes());
        buf.extend_from_slice(&self.wnd_size.to_be_bytes());
        buf.extend_from_slice(&self.seq_nr.to_be_bytes());
        buf.extend_from_slice(&self.ack_nr.to_be_bytes());

        for (i, ext) in self.extensions.iter().enumerate() {
            let next = self
                .extensions
                .get(i + 1)
                .map_or(extension::NONE, |e| e.kind);
            buf.push(next);
            buf.push(ext.data.len() as u8);
            buf.extend_from_slice(&ext.data);
        }
    }

    /// Decode a header, returning it with the offset at which the payload starts
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_SIZE {
            return Err(UtpError::invalid_header(format!(
                "Packet too short: {} bytes",
                data.len()
            )));
        }

        let type_ver = data[0];
        let version = type_ver & 0x0F;
        if version != UTP_VERSION {
            return Err(UtpError::invalid_header(format!(
                "Unsupported uTP version: {}",
                version
            )));
        }
        let packet_type = PacketType::try_from(type_ver >> 4)?;

        let mut extensions = Vec::new();
        let mut offset = HEADER_SIZE;
        let mut next_ext = data[1];

        while next_ext != extension::NONE {
            if offset + 2 > data.len() {
                return Err(UtpError::invalid_header("Extension header truncated"));
            }
            let following = data[offset];
            let ext_len = data[offset + 1] as usize;
            offset += 2;

            if offset + ext_len > data.len() {
                return Err(UtpError::invalid_header("Extension data truncated"));
            }

            extensions.push(Extension::new(
                next_ext,
                data[offset..offset + ext_len].to_vec(),
            ));
            offset += ext_len;
            next_ext = following;
        }

        let header = Self {
            packet_type,
            connection_id: u16::from_be_bytes([data[2], data[3]]),
            timestamp_us: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            timestamp_diff_us: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            wnd_size: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            seq_nr: u16::from_be_bytes([data[16], data[17]]),
            ack_nr: u16::from_be_bytes([data[18], data[19]]),
            extensions,
        };

        Ok((header, offset))
    }

    /// Check if this is a SYN packet
    pub fn is_syn(&self) -> bool {
        self.packet_type == PacketType::Syn
    }

    /// Check if this is a FIN packet
    pub fn is_fin(&self) -> bool {
        self.packet_type == PacketType::Fin
    }

    /// Check if this is a RESET packet
    pub fn is_reset(&self) -> bool {
        self.packet_type == PacketType::Reset
    }

    /// Check if this is a STATE (ACK) packet
    pub fn is_state(&self) -> bool {
        self.packet_type == PacketType::State
    }
}

/// A decoded header together with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Encode header and payload into one datagram
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header.encoded_len() + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a full datagram
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, offset) = Header::decode(data)?;
        Ok(Self {
            header,
            payload: data[offset..].to_vec(),
        })
    }
}

/// Compare sequence numbers in the wrapping 16-bit space: true if `a` precedes `b`
pub fn seq_less(a: u16, b: u16) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(packet_type: PacketType) -> Header {
        Header::new(packet_type, 12345, 100, 99)
            .with_timestamps(1_000_000, 500)
            .with_window(65535)
    }

    #[test]
    fn test_header_round_trip_all_types() {
        for ty in [
            PacketType::Data,
            PacketType::Fin,
            PacketType::State,
            PacketType::Reset,
            PacketType::Syn,
        ] {
            for extensions in [
                vec![],
                vec![SelectiveAckBuilder::default().into_extension()],
                vec![Extension::new(2, vec![0xAA; 4]), Extension::new(1, vec![1; 8])],
            ] {
                let mut h = sample_header(ty);
                h.seq_nr = 0xFFFF;
                h.ack_nr = 0;
                h.extensions = extensions;
                let encoded = h.encode();
                assert_eq!(encoded.len(), h.encoded_len());
                let (decoded, offset) = Header::decode(&encoded).unwrap();
                assert_eq!(decoded, h);
                assert_eq!(offset, encoded.len());
            }
        }
    }

    #[test]
    fn test_extension_chain_layout() {
        let h = Header::new(PacketType::State, 1, 2, 3)
            .with_extension(Extension::new(1, vec![0xFF; 8]))
            .with_extension(Extension::new(7, vec![0x01, 0x02]));
        let encoded = h.encode();

        assert_eq!(encoded[0], 0x21);
        assert_eq!(encoded[1], 1); // first extension type
        assert_eq!(encoded[20], 7); // next extension type
        assert_eq!(encoded[21], 8);
        assert_eq!(encoded[30], 0); // chain terminator
        assert_eq!(encoded[31], 2);
        assert_eq!(&encoded[32..], &[0x01, 0x02]);
    }

    #[test]
    fn test_data_packet_payload() {
        let payload = b"Hello, uTP!".to_vec();
        let pkt = Packet::new(
            Header::new(PacketType::Data, 1234, 5, 3)
                .with_extension(SelectiveAckBuilder::default().into_extension()),
            payload.clone(),
        );

        let encoded = pkt.encode();
        assert_eq!(encoded.len(), MAX_HEADER_SIZE + payload.len());
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn test_decode_rejects_short() {
        assert!(matches!(
            Header::decode(&[0x41; 19]),
            Err(UtpError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_decode_rejects_version_and_type() {
        let mut encoded = sample_header(PacketType::Data).encode();
        encoded[0] = 0x02; // version 2
        assert!(Header::decode(&encoded).is_err());

        encoded[0] = 0x51; // type 5
        assert!(Header::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_extensions() {
        let h = sample_header(PacketType::State)
            .with_extension(SelectiveAckBuilder::default().into_extension());
        let encoded = h.encode();

        // Cut inside the extension data
        assert!(Header::decode(&encoded[..25]).is_err());
        // Cut inside the extension framing
        assert!(Header::decode(&encoded[..21]).is_err());
        // Extension announced but nothing follows
        assert!(Header::decode(&encoded[..20]).is_err());
    }

    #[test]
    fn test_selective_ack_bits() {
        let mut sack = SelectiveAckBuilder::default();
        sack.set_acked(0); // ack_nr + 2
        sack.set_acked(2); // ack_nr + 4
        sack.set_acked(9); // ack_nr + 11
        sack.set_acked(64); // out of range, ignored
        let ext = sack.into_extension();
        assert_eq!(ext.data[0], 0b0000_0101);
        assert_eq!(ext.data[1], 0b0000_0010);

        let view = ext.as_selective_ack().unwrap();
        assert_eq!(view.num_bits(), 64);
        assert!(view.is_acked(0));
        assert!(!view.is_acked(1));
        assert!(view.is_acked(2));
        assert!(view.is_acked(9));
        assert!(!view.is_acked(100));
        assert_eq!(view.highest_acked(), Some(9));
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0).unwrap(), PacketType::Data);
        assert_eq!(PacketType::try_from(1).unwrap(), PacketType::Fin);
        assert_eq!(PacketType::try_from(2).unwrap(), PacketType::State);
        assert_eq!(PacketType::try_from(3).unwrap(), PacketType::Reset);
        assert_eq!(PacketType::try_from(4).unwrap(), PacketType::Syn);
        assert!(PacketType::try_from(5).is_err());
    }

    #[test]
    fn test_seq_less_wraps() {
        assert!(seq_less(10, 20));
        assert!(!seq_less(10, 10));
        assert!(!seq_less(20, 10));
        assert!(seq_less(65530, 5));
        assert!(!seq_less(5, 65530));
    }
}
