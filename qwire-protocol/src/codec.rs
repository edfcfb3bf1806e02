//! Payload codec and request encoding.
//!
//! Payloads are MessagePack. Structs are written as maps (`to_vec_named`) so
//! the node sees field names, never positional arrays.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::RequestKind;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// MessagePack payload codec.
pub struct MsgPack;

impl MsgPack {
    /// Encodes a value to payload bytes.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decodes payload bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Encodes requests into wire frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request carrying a serialized payload.
    pub fn encode_request<T: Serialize + ?Sized>(
        correlation_id: u16,
        kind: RequestKind,
        value: &T,
    ) -> Result<BytesMut, ProtocolError> {
        let payload = MsgPack::encode(value)?;
        Frame::encode(correlation_id, kind.tag(), &payload)
    }

    /// Encodes a request without a body.
    pub fn encode_empty(correlation_id: u16, kind: RequestKind) -> BytesMut {
        let mut buf = BytesMut::with_capacity(crate::FRAME_HEADER_SIZE);
        crate::frame::FrameHeader {
            payload_length: 0,
            correlation_id,
            type_tag: kind.tag(),
        }
        .write_to(&mut buf);
        buf
    }
}
