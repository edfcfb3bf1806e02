//! Incremental frame assembly from a byte stream.
//!
//! Bytes arrive in whatever chunk sizes the transport hands out. The assembler
//! buffers them and yields frames as soon as they are complete, in the order
//! their bytes appeared on the stream.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameHeader, FRAME_HEADER_SIZE};
use crate::DEFAULT_MAX_PAYLOAD_SIZE;
use bytes::{Buf, Bytes, BytesMut};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Payloads up to this size are copied out of the read buffer.
const COPY_THRESHOLD: usize = 4 * 1024;

/// Assembles frames from raw stream chunks.
///
/// One assembler belongs to one connection. After a fatal error it refuses
/// further input; a new connection gets a new (or cleared) assembler.
#[derive(Debug)]
pub struct StreamAssembler {
    buffer: BytesMut,
    /// Header parsed, payload still incomplete.
    partial: Option<FrameHeader>,
    max_payload_size: u32,
    poisoned: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Creates an assembler that rejects payloads above `max_payload_size`.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            partial: None,
            max_payload_size,
            poisoned: false,
        }
    }

    /// Appends a chunk without extracting frames.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extracts the next complete frame, if any.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }

        let header = match self.partial {
            Some(header) => header,
            None => {
                if self.buffer.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }

                let mut raw = [0u8; FRAME_HEADER_SIZE];
                raw.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
                let header = match FrameHeader::parse(&raw) {
                    Ok(header) => header,
                    Err(e) => return Err(self.poison(e)),
                };

                if header.payload_length > self.max_payload_size {
                    let err = ProtocolError::FrameTooLarge {
                        size: header.payload_length as u64,
                        max: self.max_payload_size as u64,
                    };
                    return Err(self.poison(err));
                }

                self.buffer.advance(FRAME_HEADER_SIZE);
                self.partial = Some(header);
                header
            }
        };

        let needed = header.payload_length as usize;
        if self.buffer.len() < needed {
            self.buffer.reserve(needed - self.buffer.len());
            return Ok(None);
        }

        // Small payloads are copied out so a long-lived one cannot pin the
        // read buffer. Larger ones share its allocation until dropped.
        let payload = if needed <= COPY_THRESHOLD {
            let payload = Bytes::copy_from_slice(&self.buffer[..needed]);
            self.buffer.advance(needed);
            payload
        } else {
            self.buffer.split_to(needed).freeze()
        };
        self.partial = None;

        Ok(Some(Frame::from_parts(header, payload)))
    }

    /// Appends a chunk and emits every frame that is now complete.
    ///
    /// Returns the number of frames emitted. Frames that completed before a
    /// malformed header are still emitted; the error is returned afterwards.
    pub fn feed<F>(&mut self, chunk: &[u8], mut emit: F) -> Result<usize, ProtocolError>
    where
        F: FnMut(Frame),
    {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }

        self.extend(chunk);

        let mut emitted = 0;
        while let Some(frame) = self.next_frame()? {
            emit(frame);
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Returns whether a truncated frame is waiting for more bytes.
    pub fn is_mid_frame(&self) -> bool {
        self.partial.is_some() || !self.buffer.is_empty()
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether a fatal error stopped this assembler.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Resets to a fresh state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.partial = None;
        self.poisoned = false;
    }

    fn poison(&mut self, err: ProtocolError) -> ProtocolError {
        self.poisoned = true;
        self.partial = None;
        self.buffer.clear();
        err
    }
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}
