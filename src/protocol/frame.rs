//! Frame struct with typed accessors.
//!
//! Uses `bytes::Bytes` so message bodies are shared with the read buffer
//! rather than copied.
//!
//! # Example
//!
//! ```
//! use nsq_client::protocol::{Frame, FrameType};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(FrameType::Response, Bytes::from_static(b"_heartbeat_"));
//! assert!(frame.is_heartbeat());
//! ```

use bytes::Bytes;

use super::wire_format::{
    FrameType, CLOSE_WAIT, HEARTBEAT, MESSAGE_HEADER_SIZE, MESSAGE_ID_LENGTH, OK,
};
use crate::error::{NsqError, Result};
use crate::message::MessageId;

/// A complete server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub frame_type: FrameType,
    /// Frame data (everything after the type field).
    pub payload: Bytes,
}

/// Fields of a message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Nanoseconds since the Unix epoch at which the server received the message.
    pub timestamp: i64,
    /// Delivery attempt count reported by the server.
    pub attempts: u16,
    /// Message id.
    pub id: MessageId,
    /// Message body.
    pub body: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.frame_type == FrameType::Response
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.frame_type == FrameType::Error
    }

    #[inline]
    pub fn is_message(&self) -> bool {
        self.frame_type == FrameType::Message
    }

    /// Heartbeat response.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.is_response() && self.payload() == HEARTBEAT
    }

    /// `OK` response.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.is_response() && self.payload() == OK
    }

    /// `CLOSE_WAIT` response.
    #[inline]
    pub fn is_close_wait(&self) -> bool {
        self.is_response() && self.payload() == CLOSE_WAIT
    }

    /// Split an error frame into code and description.
    ///
    /// `E_INVALID cannot SUB` yields `("E_INVALID", "cannot SUB")`.
    pub fn error_parts(&self) -> (String, String) {
        let text = String::from_utf8_lossy(self.payload());
        match text.split_once(' ') {
            Some((code, message)) => (code.to_string(), message.to_string()),
            None => (text.to_string(), String::new()),
        }
    }

    /// Convert an error frame into [`NsqError::Server`].
    pub fn to_error(&self) -> NsqError {
        let (code, message) = self.error_parts();
        NsqError::Server { code, message }
    }

    /// Decode a message frame.
    pub fn decode_message(&self) -> Result<DecodedMessage> {
        if !self.is_message() {
            return Err(NsqError::Protocol(format!(
                "expected message frame, got {:?}",
                self.frame_type
            )));
        }
        let data = &self.payload;
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(NsqError::Protocol(format!(
                "message frame of {} bytes is shorter than its header",
                data.len()
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[0..8]);
        let mut id = [0u8; MESSAGE_ID_LENGTH];
        id.copy_from_slice(&data[10..MESSAGE_HEADER_SIZE]);

        Ok(DecodedMessage {
            timestamp: i64::from_be_bytes(ts),
            attempts: u16::from_be_bytes([data[8], data[9]]),
            id: MessageId::new(id),
            body: data.slice(MESSAGE_HEADER_SIZE..),
        })
    }
}
