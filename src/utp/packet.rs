// utp/packet.rs

#![forbid(unsafe_code)]

use crate::utp::common::{
    ConnectionId, DEFAULT_WINDOW_SIZE, NO_EXTENSION, ST_DATA, ST_FIN, ST_RESET, ST_STATE, ST_SYN,
    UTP_VERSION, UtpError,
};

/// Fixed header length, no extension chain follows it
pub const BASE_HEADER_SIZE: usize = 20;

/// Decoded header, every multi-byte field in host order.
///
/// Layout on the wire (big-endian):
/// `type<<4|version`, `extension`, `connection_id:u16`, `timestamp:u32`,
/// `timestamp_diff:u32`, `wnd_size:u32`, `seq_nr:u16`, `ack_nr:u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtpHeader {
    pub packet_type: u8,
    pub version: u8,
    pub extension: u8,
    pub connection_id: ConnectionId,
    /// Low 32 bits of the sender's microsecond clock
    pub timestamp_micros: u32,
    /// Always zero, delay measurement is not implemented
    pub timestamp_diff_micros: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl UtpHeader {
    pub fn new(
        packet_type: u8,
        connection_id: ConnectionId,
        timestamp_micros: u32,
        seq_nr: u16,
        ack_nr: u16,
    ) -> Self {
        Self {
            packet_type,
            version: UTP_VERSION,
            extension: NO_EXTENSION,
            connection_id,
            timestamp_micros,
            timestamp_diff_micros: 0,
            wnd_size: DEFAULT_WINDOW_SIZE,
            seq_nr,
            ack_nr,
        }
    }

    pub fn serialize(&self, buffer: &mut Vec<u8>) {
        buffer.push((self.packet_type << 4) | (self.version & 0x0F));
        buffer.push(self.extension);
        buffer.extend_from_slice(&self.connection_id.to_be_bytes());
        buffer.extend_from_slice(&self.timestamp_micros.to_be_bytes());
        buffer.extend_from_slice(&self.timestamp_diff_micros.to_be_bytes());
        buffer.extend_from_slice(&self.wnd_size.to_be_bytes());
        buffer.extend_from_slice(&self.seq_nr.to_be_bytes());
        buffer.extend_from_slice(&self.ack_nr.to_be_bytes());
    }

    pub fn deserialize(buffer: &[u8]) -> Option<Self> {
        let b = buffer.get(..BASE_HEADER_SIZE)?;
        Some(Self {
            packet_type: b[0] >> 4,
            version: b[0] & 0x0F,
            extension: b[1],
            connection_id: u16::from_be_bytes([b[2], b[3]]),
            timestamp_micros: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            timestamp_diff_micros: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            wnd_size: u32::from_be_bytes([b[12], b[13], b[14], b[15]]),
            seq_nr: u16::from_be_bytes([b[16], b[17]]),
            ack_nr: u16::from_be_bytes([b[18], b[19]]),
        })
    }
}

/// A complete packet with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtpPacket {
    pub header: UtpHeader,
    pub payload: Vec<u8>,
}

impl UtpPacket {
    /// Parse a datagram. Only the length is checked: unknown types and
    /// versions decode and are left to the receiver.
    pub fn decode(data: &[u8]) -> Result<Self, UtpError> {
        let header = UtpHeader::deserialize(data).ok_or(UtpError::MalformedPacket)?;
        Ok(Self {
            header,
            payload: data[BASE_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn serialize(&self, buffer: &mut Vec<u8>) {
        buffer.clear();
        buffer.reserve(self.total_size());
        self.header.serialize(buffer);
        buffer.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.total_size());
        self.serialize(&mut buffer);
        buffer
    }

    pub fn total_size(&self) -> usize {
        BASE_HEADER_SIZE + self.payload.len()
    }

    pub fn packet_type(&self) -> u8 {
        self.header.packet_type
    }

    pub fn new(
        packet_type: u8,
        connection_id: ConnectionId,
        seq_nr: u16,
        ack_nr: u16,
        timestamp_micros: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header: UtpHeader::new(packet_type, connection_id, timestamp_micros, seq_nr, ack_nr),
            payload,
        }
    }

    pub fn create_syn(connection_id: ConnectionId, seq_nr: u16, timestamp_micros: u32) -> Self {
        Self::new(ST_SYN, connection_id, seq_nr, 0, timestamp_micros, Vec::new())
    }

    pub fn create_data(
        connection_id: ConnectionId,
        seq_nr: u16,
        ack_nr: u16,
        timestamp_micros: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self::new(ST_DATA, connection_id, seq_nr, ack_nr, timestamp_micros, payload)
    }

    /// STATE packet, used for acks and keepalives
    pub fn create_state(
        connection_id: ConnectionId,
        seq_nr: u16,
        ack_nr: u16,
        timestamp_micros: u32,
    ) -> Self {
        Self::new(ST_STATE, connection_id, seq_nr, ack_nr, timestamp_micros, Vec::new())
    }

    pub fn create_fin(
        connection_id: ConnectionId,
        seq_nr: u16,
        ack_nr: u16,
        timestamp_micros: u32,
    ) -> Self {
        Self::new(ST_FIN, connection_id, seq_nr, ack_nr, timestamp_micros, Vec::new())
    }

    pub fn create_reset(
        connection_id: ConnectionId,
        seq_nr: u16,
        ack_nr: u16,
        timestamp_micros: u32,
    ) -> Self {
        Self::new(ST_RESET, connection_id, seq_nr, ack_nr, timestamp_micros, Vec::new())
    }
}
