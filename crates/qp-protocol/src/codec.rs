//! Tokio codec for newline-delimited JSON frames
//!
//! Each frame is one JSON object followed by `\n`. JSON never contains a raw
//! newline inside a value, so the line terminator alone delimits frames.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::Frame;

/// Maximum encoded size of a single frame (16MB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Bytes of the buffer already scanned for a newline
    next_index: usize,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { next_index: 0 }
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if src.len() > MAX_FRAME_LENGTH {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        max: MAX_FRAME_LENGTH,
                    });
                }
                // Need more data
                self.next_index = src.len();
                return Ok(None);
            };

            let line_end = self.next_index + offset;
            self.next_index = 0;

            if line_end > MAX_FRAME_LENGTH {
                return Err(ProtocolError::FrameTooLarge {
                    size: line_end,
                    max: MAX_FRAME_LENGTH,
                });
            }

            let line = src.split_to(line_end + 1);
            let body = trim_ascii(&line[..line_end]);
            if body.is_empty() {
                tracing::trace!("Skipping blank line");
                continue;
            }

            let frame: Frame = serde_json::from_slice(body)?;
            tracing::trace!("Decoded {} frame ({} bytes)", frame.kind(), body.len());
            return Ok(Some(frame));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        // A final frame may arrive without its trailing newline
        self.next_index = 0;
        let rest = buf.split();
        let body = trim_ascii(&rest);
        if body.is_empty() {
            return Ok(None);
        }

        let frame: Frame = serde_json::from_slice(body)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&frame)?;

        if payload.len() > MAX_FRAME_LENGTH {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_LENGTH,
            });
        }

        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(&payload);
        dst.put_u8(b'\n');

        Ok(())
    }
}
