//! Reassembly of server frames from arbitrary read chunks.
//!
//! Bytes are appended as they arrive; a frame is split off only once all of
//! it is buffered, so the buffer always starts at a frame boundary. That
//! matters when the stream switches to deflate right after a response: the
//! unread tail can be handed over untouched.

use bytes::{Bytes, BytesMut};

use super::wire_format::{FrameHeader, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

const INITIAL_CAPACITY: usize = 16 * 1024;

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_size: u32,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Reject frames whose size field exceeds `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_frame_size,
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Split off the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Fails on an invalid frame type or an oversized frame; the stream is
    /// unusable afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(header) = FrameHeader::decode(&self.buf, self.max_frame_size)? else {
            return Ok(None);
        };
        let total = HEADER_SIZE + header.data_length as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        let data = frame.split_off(HEADER_SIZE).freeze();
        Ok(Some(Frame::new(header.frame_type, data)))
    }

    /// Append `data` and return every frame now complete.
    #[cfg(test)]
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Hand over every unread byte, starting at a frame boundary.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
