//! Incremental frame extraction from a connection's read buffer.
//!
//! Bytes arrive in arbitrary chunks; the decoder remembers a parsed header
//! across calls so that a frame split over many reads is only inspected
//! once its body is fully buffered.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, Bytes, BytesMut};

use crate::protocol::messages::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Untagged startup-phase packet, including its length prefix.
    Startup(Bytes),
    Message { tag: u8, body: Bytes },
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    tag: Option<u8>,
    body_len: usize,
}

#[derive(Debug)]
pub struct FrameDecoder {
    header: Option<FrameHeader>,
    max_message_size: usize,
    expect_startup: bool,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            header: None,
            max_message_size,
            expect_startup: true,
        }
    }

    /// Switches to tagged messages once the startup packet has been accepted.
    /// An SSL or GSSENC probe keeps the decoder in startup mode.
    pub fn set_expect_startup(&mut self, expect_startup: bool) {
        debug_assert!(self.header.is_none());
        self.expect_startup = expect_startup;
    }

    /// Whether `buf` holds at least a complete header for the next frame.
    pub fn header_available(&self, buf: &BytesMut) -> bool {
        self.header.is_some() || buf.len() >= self.header_len()
    }

    fn header_len(&self) -> usize {
        if self.expect_startup { 4 } else { 5 }
    }

    /// Removes the next complete frame from `buf`, or returns `None` when
    /// more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if buf.len() < self.header_len() {
                    return Ok(None);
                }
                let header = self.parse_header(buf)?;
                self.header = Some(header);
                header
            }
        };

        if buf.len() < header.body_len {
            buf.reserve(header.body_len - buf.len());
            return Ok(None);
        }

        self.header = None;
        let body = buf.split_to(header.body_len).freeze();
        Ok(Some(match header.tag {
            Some(tag) => Frame::Message { tag, body },
            None => Frame::Startup(body),
        }))
    }

    fn parse_header(&self, buf: &mut BytesMut) -> Result<FrameHeader, ProtocolError> {
        if self.expect_startup {
            let declared = BigEndian::read_u32(&buf[..4]);
            let total = self.checked_len(declared)?;
            // startup packets keep their length prefix for decode_startup_action
            Ok(FrameHeader {
                tag: None,
                body_len: total,
            })
        } else {
            let tag = buf[0];
            let declared = BigEndian::read_u32(&buf[1..5]);
            let total = self.checked_len(declared)?;
            buf.advance(5);
            Ok(FrameHeader {
                tag: Some(tag),
                body_len: total - 4,
            })
        }
    }

    fn checked_len(&self, declared: u32) -> Result<usize, ProtocolError> {
        if declared < 4 {
            return Err(ProtocolError::InvalidLength(declared));
        }
        let declared = declared as usize;
        if declared - 4 > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                declared,
                limit: self.max_message_size,
            });
        }
        Ok(declared)
    }
}
