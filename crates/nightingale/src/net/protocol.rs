use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

pub const HEADER_SIZE: usize = 17;
pub const MAX_PACKET_SIZE: usize = 512;
pub const PROTOCOL_MAGIC: u32 = 103_675_707;
pub const DEFAULT_PORT: u16 = 27016;

pub const ANONYMOUS_CONNECTION_ID: u32 = 0;
pub const MIN_CONNECTION_ID: u32 = 1;
pub const MAX_CONNECTION_ID: u32 = 255;

pub const SEQUENCE_NOT_APPLICABLE: u32 = 0;
pub const MIN_SEQUENCE: u32 = 1;
pub const MAX_SEQUENCE: u32 = 65535;

const SEQUENCE_RANGE: i32 = (MAX_SEQUENCE - MIN_SEQUENCE + 1) as i32;
const SEQUENCE_HALF_RANGE: i32 = ((MAX_SEQUENCE - MIN_SEQUENCE) / 2) as i32;

/// Returns the sequence number that follows `sequence`, skipping the
/// reserved "not applicable" value.
#[inline]
pub fn next_sequence_number(sequence: u32) -> u32 {
    if sequence == SEQUENCE_NOT_APPLICABLE || sequence >= MAX_SEQUENCE {
        MIN_SEQUENCE
    } else {
        sequence + 1
    }
}

#[inline]
pub fn next_connection_id(connection_id: u32) -> u32 {
    if connection_id == ANONYMOUS_CONNECTION_ID || connection_id >= MAX_CONNECTION_ID {
        MIN_CONNECTION_ID
    } else {
        connection_id + 1
    }
}

/// Signed shortest distance from `earlier` to `later` on the sequence cycle.
///
/// Positive when `later` is newer than `earlier`. Raw subtraction is folded
/// back into half the range, so 65535 -> 1 is a distance of 1 and not -65534.
#[inline]
pub fn sequence_delta(earlier: u32, later: u32) -> i32 {
    let delta = later as i32 - earlier as i32;
    if delta < -SEQUENCE_HALF_RANGE {
        delta + SEQUENCE_RANGE
    } else if delta > SEQUENCE_HALF_RANGE {
        delta - SEQUENCE_RANGE
    } else {
        delta
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    sequence_delta(s2, s1) > 0
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const IMMEDIATE_RESPONSE = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0x00,
    Application = 0x80,
    Ping = 0x81,
    PingResponse = 0x82,
    ConnectRequest = 0x83,
    ConnectionAccepted = 0x84,
    ConnectionRefused = 0x85,
    ForceDisconnect = 0x86,
    ClientDisconnect = 0x87,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x80 => Self::Application,
            0x81 => Self::Ping,
            0x82 => Self::PingResponse,
            0x83 => Self::ConnectRequest,
            0x84 => Self::ConnectionAccepted,
            0x85 => Self::ConnectionRefused,
            0x86 => Self::ForceDisconnect,
            0x87 => Self::ClientDisconnect,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol: u32,
    pub connection_id: u32,
    pub sequence: u32,
    pub duplicate_of: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
    pub flags: PacketFlags,
    pub message_type: MessageType,
}

impl PacketHeader {
    pub fn new(connection_id: u32, message_type: MessageType) -> Self {
        Self {
            protocol: PROTOCOL_MAGIC,
            connection_id,
            sequence: SEQUENCE_NOT_APPLICABLE,
            duplicate_of: SEQUENCE_NOT_APPLICABLE,
            ack: SEQUENCE_NOT_APPLICABLE,
            ack_bitfield: 0,
            flags: PacketFlags::empty(),
            message_type,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.protocol == PROTOCOL_MAGIC
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("connection id must be 0 or between 1 and 255, got {0}")]
    OutOfRangeConnectionId(u32),
    #[error("sequence numbers must be 0 or between 1 and 65535, got {0}")]
    OutOfRangeSequenceNumber(u32),
    #[error("packet of {0} bytes exceeds the 512 byte limit")]
    PayloadTooLarge(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MalformedPacketError {
    #[error("cannot build a packet from an empty datagram")]
    Empty,
    #[error("packet requires at least 17 bytes, got {0}")]
    TooShort(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Option<String>,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Option<String>) -> Self {
        Self {
            header,
            payload: payload.filter(|p| !p.is_empty()),
        }
    }

    pub fn application(connection_id: u32, message: &str) -> Self {
        let header = PacketHeader::new(connection_id, MessageType::Application);
        Self::new(header, Some(message.to_owned()))
    }

    pub fn ping(connection_id: u32, latency: Option<Duration>) -> Self {
        let header = PacketHeader::new(connection_id, MessageType::Ping);
        Self::new(header, latency.map(|l| l.as_millis().to_string()))
    }

    pub fn ping_response(connection_id: u32) -> Self {
        let mut header = PacketHeader::new(connection_id, MessageType::PingResponse);
        header.flags |= PacketFlags::IMMEDIATE_RESPONSE;
        Self::new(header, None)
    }

    pub fn connect_request() -> Self {
        let header = PacketHeader::new(ANONYMOUS_CONNECTION_ID, MessageType::ConnectRequest);
        Self::new(header, None)
    }

    pub fn connection_accepted(connection_id: u32) -> Self {
        let header = PacketHeader::new(connection_id, MessageType::ConnectionAccepted);
        Self::new(header, None)
    }

    pub fn connection_refused() -> Self {
        let header = PacketHeader::new(ANONYMOUS_CONNECTION_ID, MessageType::ConnectionRefused);
        Self::new(header, None)
    }

    pub fn force_disconnect(connection_id: u32, reason: &str) -> Self {
        let header = PacketHeader::new(connection_id, MessageType::ForceDisconnect);
        Self::new(header, Some(reason.to_owned()))
    }

    pub fn client_disconnect(connection_id: u32) -> Self {
        let header = PacketHeader::new(connection_id, MessageType::ClientDisconnect);
        Self::new(header, None)
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn is_valid_protocol(&self) -> bool {
        self.header.is_valid()
    }

    pub fn is_anonymous(&self) -> bool {
        self.header.connection_id == ANONYMOUS_CONNECTION_ID
    }

    pub fn has_sequence(&self) -> bool {
        self.header.sequence != SEQUENCE_NOT_APPLICABLE
    }

    pub fn is_duplicate(&self) -> bool {
        self.header.duplicate_of != SEQUENCE_NOT_APPLICABLE
    }

    pub fn has_ack(&self) -> bool {
        self.header.ack != SEQUENCE_NOT_APPLICABLE
    }

    pub fn is_immediate_response(&self) -> bool {
        self.header.flags.contains(PacketFlags::IMMEDIATE_RESPONSE)
    }

    /// Id the peer should be told about when this packet goes undelivered:
    /// the original message for a resend, otherwise the packet itself.
    pub fn resend_of(&self) -> u32 {
        if self.is_duplicate() {
            self.header.duplicate_of
        } else {
            self.header.sequence
        }
    }

    /// Latency sample carried by a ping, in whole milliseconds.
    pub fn latency_sample(&self) -> Option<Duration> {
        self.payload
            .as_deref()
            .and_then(|p| p.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let header = &self.header;
        let connection_id = encode_connection_id(header.connection_id)?;
        let sequence = encode_sequence(header.sequence)?;
        let duplicate_of = encode_sequence(header.duplicate_of)?;
        let ack = encode_sequence(header.ack)?;

        let payload = self.payload.as_deref().unwrap_or_default().as_bytes();
        let size = HEADER_SIZE + payload.len();
        if size > MAX_PACKET_SIZE {
            return Err(EncodingError::PayloadTooLarge(size));
        }

        let mut data = Vec::with_capacity(size);
        data.extend_from_slice(&header.protocol.to_be_bytes());
        data.push(connection_id);
        data.extend_from_slice(&sequence.to_be_bytes());
        data.extend_from_slice(&duplicate_of.to_be_bytes());
        data.extend_from_slice(&ack.to_be_bytes());
        data.extend_from_slice(&header.ack_bitfield.to_be_bytes());
        data.push(header.flags.bits());
        data.push(header.message_type.code());
        data.extend_from_slice(payload);

        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MalformedPacketError> {
        if data.is_empty() {
            return Err(MalformedPacketError::Empty);
        }
        if data.len() < HEADER_SIZE {
            return Err(MalformedPacketError::TooShort(data.len()));
        }

        let header = PacketHeader {
            protocol: read_u32(data, 0),
            connection_id: data[4] as u32,
            sequence: read_u16(data, 5) as u32,
            duplicate_of: read_u16(data, 7) as u32,
            ack: read_u16(data, 9) as u32,
            ack_bitfield: read_u32(data, 11),
            flags: PacketFlags::from_bits_truncate(data[15]),
            message_type: MessageType::from_code(data[16]),
        };
        let payload = String::from_utf8_lossy(&data[HEADER_SIZE..]).into_owned();

        Ok(Self::new(header, Some(payload)))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        write!(f, "{:?}", h.message_type)?;
        if !h.is_valid() {
            write!(f, " [invalid protocol {:#010x}]", h.protocol)?;
        }
        if self.is_anonymous() {
            write!(f, " conn=anon")?;
        } else {
            write!(f, " conn={}", h.connection_id)?;
        }
        write!(f, " seq={}", h.sequence)?;
        if self.is_duplicate() {
            write!(f, " dup={}", h.duplicate_of)?;
        }
        write!(f, " ack={} bits={:#034b}", h.ack, h.ack_bitfield)?;
        if self.is_immediate_response() {
            write!(f, " immediate")?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " {:?}", payload)?;
        }
        Ok(())
    }
}

fn encode_connection_id(connection_id: u32) -> Result<u8, EncodingError> {
    u8::try_from(connection_id).map_err(|_| EncodingError::OutOfRangeConnectionId(connection_id))
}

fn encode_sequence(sequence: u32) -> Result<u16, EncodingError> {
    u16::try_from(sequence).map_err(|_| EncodingError::OutOfRangeSequenceNumber(sequence))
}

#[inline]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_sequence_number_wraps() {
        assert_eq!(next_sequence_number(SEQUENCE_NOT_APPLICABLE), 1);
        assert_eq!(next_sequence_number(1), 2);
        assert_eq!(next_sequence_number(MAX_SEQUENCE), 1);
    }

    #[test]
    fn test_next_connection_id_wraps() {
        assert_eq!(next_connection_id(ANONYMOUS_CONNECTION_ID), 1);
        assert_eq!(next_connection_id(200), 201);
        assert_eq!(next_connection_id(MAX_CONNECTION_ID), 1);
    }

    #[test]
    fn test_sequence_delta_across_wraparound() {
        assert_eq!(sequence_delta(1, 2), 1);
        assert_eq!(sequence_delta(2, 1), -1);
        assert_eq!(sequence_delta(65535, 1), 1);
        assert_eq!(sequence_delta(1, 65535), -1);
        assert_eq!(sequence_delta(65530, 5), 10);
        assert!(sequence_greater_than(3, 65534));
        assert!(!sequence_greater_than(65534, 3));
    }

    #[test]
    fn test_sequence_delta_recovers_step_count() {
        for start in [1u32, 1000, 32768, 65000, 65535] {
            let mut current = start;
            for steps in 0..32768i32 {
                assert_eq!(sequence_delta(start, current), steps);
                current = next_sequence_number(current);
            }
        }
    }

    #[test]
    fn test_packet_round_trip() {
        let mut packet = Packet::application(200, "HELLO");
        packet.header.sequence = 65535;
        packet.header.duplicate_of = 40000;
        packet.header.ack = 12;
        packet.header.ack_bitfield = 0x8000_0001;

        let data = packet.encode().unwrap();
        assert_eq!(data.len(), HEADER_SIZE + 5);

        let decoded = Packet::decode(&data).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_valid_protocol());
    }

    #[test]
    fn test_wire_layout() {
        let mut packet = Packet::ping_response(130);
        packet.header.sequence = 0x1234;
        packet.header.ack = 0xABCD;
        packet.header.ack_bitfield = 0x0102_0304;

        let data = packet.encode().unwrap();
        assert_eq!(
            data,
            vec![
                0x06, 0x2D, 0xF7, 0x3B, // magic
                130,  // connection id
                0x12, 0x34, // sequence
                0x00, 0x00, // duplicate of
                0xAB, 0xCD, // ack
                0x01, 0x02, 0x03, 0x04, // ack bitfield
                0x80, // flags
                0x82, // message type
            ]
        );
    }

    #[test]
    fn test_empty_payload_is_normalized() {
        let packet = Packet::application(1, "");
        assert_eq!(packet.payload, None);

        let data = packet.encode().unwrap();
        assert_eq!(data.len(), HEADER_SIZE);
        assert_eq!(Packet::decode(&data).unwrap().payload, None);
    }

    #[test]
    fn test_decode_rejects_short_datagrams() {
        assert_eq!(Packet::decode(&[]), Err(MalformedPacketError::Empty));
        assert_eq!(
            Packet::decode(&[0u8; 16]),
            Err(MalformedPacketError::TooShort(16))
        );
    }

    #[test]
    fn test_encode_rejects_out_of_range_fields() {
        let mut packet = Packet::connect_request();
        packet.header.connection_id = 256;
        assert_eq!(
            packet.encode(),
            Err(EncodingError::OutOfRangeConnectionId(256))
        );

        let mut packet = Packet::connect_request();
        packet.header.ack = 65536;
        assert_eq!(
            packet.encode(),
            Err(EncodingError::OutOfRangeSequenceNumber(65536))
        );

        let packet = Packet::application(1, &"x".repeat(MAX_PACKET_SIZE));
        assert!(matches!(
            packet.encode(),
            Err(EncodingError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_foreign_magic_decodes_as_invalid_protocol() {
        let mut data = Packet::connect_request().encode().unwrap();
        data[0] = 0xFF;
        let packet = Packet::decode(&data).unwrap();
        assert!(!packet.is_valid_protocol());
    }

    #[test]
    fn test_unknown_message_type_decodes_as_invalid() {
        let mut data = Packet::connect_request().encode().unwrap();
        data[16] = 0x42;
        assert_eq!(
            Packet::decode(&data).unwrap().message_type(),
            MessageType::Invalid
        );
    }

    #[test]
    fn test_ping_latency_payload() {
        let ping = Packet::ping(3, Some(Duration::from_millis(42)));
        assert_eq!(ping.payload.as_deref(), Some("42"));
        assert_eq!(ping.latency_sample(), Some(Duration::from_millis(42)));

        let unknown = Packet::ping(3, None);
        assert_eq!(unknown.latency_sample(), None);
    }

    #[test]
    fn test_resend_of_prefers_original_id() {
        let mut packet = Packet::application(1, "A");
        packet.header.sequence = 9;
        assert_eq!(packet.resend_of(), 9);
        packet.header.duplicate_of = 5;
        assert_eq!(packet.resend_of(), 5);
    }
}
