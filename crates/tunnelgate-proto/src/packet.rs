//! Packet framing for the tunnel wire protocol
//!
//! Every packet is a fixed 22-byte big-endian header followed by the payload:
//!
//! ```text
//! magic(1) | type(1) | connection_id(8) | sequence(4) | status_code(4) | payload_size(4) | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{MAGIC, MAX_PAYLOAD_SIZE};

/// Framing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Bad magic byte: {0} (expected 110)")]
    BadMagic(u8),

    #[error("Unknown packet type: {0}")]
    UnknownType(u8),

    #[error("Short header: only {0} bytes available")]
    ShortHeader(usize),

    #[error("Short payload: {available} bytes available, {expected} declared")]
    ShortPayload { expected: u32, available: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
}

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    /// Control-plane signal; carried but never acted on
    Notice = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Request),
            1 => Ok(PacketType::Response),
            2 => Ok(PacketType::Notice),
            _ => Err(FramingError::UnknownType(value)),
        }
    }
}

/// Fixed-width packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    /// Reserved. Written as zero, echoed on responses, ignored on receipt.
    pub connection_id: u64,
    pub sequence: u32,
    pub status_code: i32,
}

impl PacketHeader {
    /// magic (1) + type (1) + connection_id (8) + sequence (4) + status_code (4) + payload_size (4)
    pub const SIZE: usize = 22;
}

/// One unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Request packet tagged with `sequence`
    pub fn request(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(
            PacketHeader {
                packet_type: PacketType::Request,
                connection_id: 0,
                sequence,
                status_code: 0,
            },
            payload,
        )
    }

    /// Response to `request`, carrying the same sequence and connection id
    pub fn response_to(
        request: &PacketHeader,
        status_code: i32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(
            PacketHeader {
                packet_type: PacketType::Response,
                connection_id: request.connection_id,
                sequence: request.sequence,
                status_code,
            },
            payload,
        )
    }

    pub fn notice(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(
            PacketHeader {
                packet_type: PacketType::Notice,
                connection_id: 0,
                sequence,
                status_code: 0,
            },
            payload,
        )
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn payload_size(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> Result<Bytes, FramingError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE as usize {
            return Err(FramingError::PayloadTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(PacketHeader::SIZE + payload_len);

        buf.put_u8(MAGIC);
        buf.put_u8(self.header.packet_type as u8);
        buf.put_u64(self.header.connection_id);
        buf.put_u32(self.header.sequence);
        buf.put_i32(self.header.status_code);
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode one packet from the front of `buf`, advancing it past the packet.
    ///
    /// Bytes after the packet are left in `buf` untouched.
    pub fn decode(buf: &mut Bytes) -> Result<Self, FramingError> {
        if buf.len() < PacketHeader::SIZE {
            return Err(FramingError::ShortHeader(buf.len()));
        }

        // Peek before consuming so a rejected header leaves the buffer intact
        let magic = buf[0];
        if magic != MAGIC {
            return Err(FramingError::BadMagic(magic));
        }
        let packet_type = PacketType::try_from(buf[1])?;

        let mut header = &buf[2..PacketHeader::SIZE];
        let connection_id = header.get_u64();
        let sequence = header.get_u32();
        let status_code = header.get_i32();
        let payload_size = header.get_u32();

        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(FramingError::PayloadTooLarge(payload_size as usize));
        }

        let available = buf.len() - PacketHeader::SIZE;
        if available < payload_size as usize {
            return Err(FramingError::ShortPayload {
                expected: payload_size,
                available,
            });
        }

        buf.advance(PacketHeader::SIZE);
        let payload = buf.split_to(payload_size as usize);

        Ok(Self {
            header: PacketHeader {
                packet_type,
                connection_id,
                sequence,
                status_code,
            },
            payload,
        })
    }

    /// Parse a message that must contain exactly one packet
    pub fn parse(message: Bytes) -> Result<Self, FramingError> {
        let mut buf = message;
        let packet = Self::decode(&mut buf)?;
        if !buf.is_empty() {
            return Err(FramingError::TrailingBytes(buf.len()));
        }
        Ok(packet)
    }
}
