//! # qwire-protocol
//!
//! Wire protocol implementation for qwire.
//!
//! This crate provides:
//! - 8-byte header framing with a type-tag checksum
//! - Incremental frame assembly from a byte stream
//! - Type-tag classification (events, responses, requests)
//! - Error codes and the MessagePack payload codec

pub mod assembler;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use assembler::StreamAssembler;
pub use codec::{Encoder, MsgPack};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameHeader, FRAME_HEADER_SIZE};
pub use message::{EventKind, PacketKind, RequestKind, ResponseKind};

/// Default port of a node's client listener.
pub const DEFAULT_PORT: u16 = 9200;

/// Default maximum frame payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;
