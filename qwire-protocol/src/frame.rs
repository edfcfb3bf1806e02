//! Binary frame format.
//!
//! Frame layout (8 bytes header + payload):
//!
//! ```text
//! +----------------+----------------+----------+----------+
//! | payload_length | correlation_id | type_tag | checksum |
//! |  4 bytes (LE)  |  2 bytes (LE)  |  1 byte  |  1 byte  |
//! +----------------+----------------+----------+----------+
//! | payload                                               |
//! | payload_length bytes                                  |
//! +-------------------------------------------------------+
//! ```
//!
//! The checksum byte is always `0xFF ^ type_tag`. The layout is not versioned:
//! any change to it is a breaking wire change.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (4+2+1+1 = 8).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Computes the checksum byte for a type tag.
#[inline]
pub const fn checksum(type_tag: u8) -> u8 {
    0xFF ^ type_tag
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Number of payload bytes following the header.
    pub payload_length: u32,
    /// Request/response pairing key.
    pub correlation_id: u16,
    /// Packet type tag.
    pub type_tag: u8,
}

impl FrameHeader {
    /// Parses and validates an 8-byte header.
    pub fn parse(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let payload_length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let correlation_id = u16::from_le_bytes([bytes[4], bytes[5]]);
        let type_tag = bytes[6];
        let check = bytes[7];

        if check != checksum(type_tag) {
            return Err(ProtocolError::MalformedHeader {
                type_tag,
                checksum: check,
            });
        }

        Ok(Self {
            payload_length,
            correlation_id,
            type_tag,
        })
    }

    /// Writes the header, including its checksum, into `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.payload_length);
        buf.put_u16_le(self.correlation_id);
        buf.put_u8(self.type_tag);
        buf.put_u8(checksum(self.type_tag));
    }

    /// Total encoded size of the frame this header describes.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_length as usize
    }
}

/// One assembled frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Builds a frame from a parsed header and its payload.
    ///
    /// Callers must pass exactly `header.payload_length` bytes.
    pub(crate) fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        debug_assert_eq!(header.payload_length as usize, payload.len());
        Self { header, payload }
    }

    /// Creates a frame for sending.
    pub fn new(
        correlation_id: u16,
        type_tag: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        let payload_length =
            u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
                size: payload.len() as u64,
                max: u32::MAX as u64,
            })?;

        Ok(Self {
            header: FrameHeader {
                payload_length,
                correlation_id,
                type_tag,
            },
            payload,
        })
    }

    pub fn header(&self) -> FrameHeader {
        self.header
    }

    pub fn payload_length(&self) -> u32 {
        self.header.payload_length
    }

    pub fn correlation_id(&self) -> u16 {
        self.header.correlation_id
    }

    pub fn type_tag(&self) -> u8 {
        self.header.type_tag
    }

    pub fn checksum(&self) -> u8 {
        checksum(self.header.type_tag)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Encodes header and payload into a single buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header.frame_len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    /// Encodes a frame straight from its parts.
    pub fn encode(
        correlation_id: u16,
        type_tag: u8,
        payload: &[u8],
    ) -> Result<BytesMut, ProtocolError> {
        let payload_length =
            u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
                size: payload.len() as u64,
                max: u32::MAX as u64,
            })?;

        let header = FrameHeader {
            payload_length,
            correlation_id,
            type_tag,
        };
        let mut buf = BytesMut::with_capacity(header.frame_len());
        header.write_to(&mut buf);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on a malformed header.
    /// Nothing is consumed unless a complete frame is returned.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::parse(&raw)?;

        if buf.len() < header.frame_len() {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.payload_length as usize).freeze();

        Ok(Some(Self::from_parts(header, payload)))
    }
}
