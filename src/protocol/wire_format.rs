//! Wire format constants and the frame header.
//!
//! Every server-to-client frame is:
//! ```text
//! ┌──────────┬──────────┬──────────────────┐
//! │ Size     │ Type     │ Data             │
//! │ 4 bytes  │ 4 bytes  │ Size - 4 bytes   │
//! │ uint32 BE│ uint32 BE│                  │
//! └──────────┴──────────┴──────────────────┘
//! ```
//!
//! `Size` counts the type field plus the data. Message frames carry:
//! ```text
//! ┌───────────┬──────────┬────────────┬──────┐
//! │ Timestamp │ Attempts │ Message ID │ Body │
//! │ 8 bytes   │ 2 bytes  │ 16 bytes   │ ...  │
//! │ int64 BE  │ uint16 BE│ hex ASCII  │      │
//! └───────────┴──────────┴────────────┴──────┘
//! ```

use crate::error::{NsqError, Result};

/// Protocol magic sent immediately after connecting.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Size of the frame header (size + type).
pub const HEADER_SIZE: usize = 8;

/// Size of the message header that precedes the body in a message frame.
pub const MESSAGE_HEADER_SIZE: usize = 8 + 2 + MESSAGE_ID_LENGTH;

/// Length of a message id on the wire.
pub const MESSAGE_ID_LENGTH: usize = 16;

/// Default upper bound for a single frame's size field.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Response payload of a server heartbeat.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Generic success response.
pub const OK: &[u8] = b"OK";

/// Response to CLS once the server stops sending messages.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Error codes after which the connection stays usable.
pub const NON_FATAL_ERROR_CODES: [&str; 3] = ["E_FIN_FAILED", "E_REQ_FAILED", "E_TOUCH_FAILED"];

/// Whether an error frame with this code closes the connection.
pub fn is_fatal_error_code(code: &str) -> bool {
    !NON_FATAL_ERROR_CODES.contains(&code)
}

/// Kind of server frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    /// Reply to a command, or a heartbeat.
    Response = 0,
    /// `E_*` error.
    Error = 1,
    /// Delivered message.
    Message = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = NsqError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(NsqError::Protocol(format!("unknown frame type {}", other))),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind.
    pub frame_type: FrameType,
    /// Bytes of data following the header.
    pub data_length: u32,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(frame_type: FrameType, data_length: u32) -> Self {
        Self {
            frame_type,
            data_length,
        }
    }

    /// Encode to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use nsq_client::protocol::{FrameHeader, FrameType};
    ///
    /// let bytes = FrameHeader::new(FrameType::Response, 2).encode();
    /// assert_eq!(bytes, [0, 0, 0, 6, 0, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let size = self.data_length.saturating_add(4);
        buf[0..4].copy_from_slice(&size.to_be_bytes());
        buf[4..8].copy_from_slice(&(self.frame_type as u32).to_be_bytes());
        buf
    }

    /// Decode from bytes, validating the size field against `max_frame_size`.
    ///
    /// Returns `Ok(None)` if the buffer is too short.
    pub fn decode(buf: &[u8], max_frame_size: u32) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if size < 4 {
            return Err(NsqError::Protocol(format!("frame size {} too small", size)));
        }
        if size > max_frame_size {
            return Err(NsqError::Protocol(format!(
                "frame size {} exceeds maximum {}",
                size, max_frame_size
            )));
        }
        let frame_type = FrameType::try_from(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]))?;
        Ok(Some(Self {
            frame_type,
            data_length: size - 4,
        }))
    }
}

/// Encode a complete frame; used by servers and tests.
pub fn encode_frame(frame_type: FrameType, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
    buf.extend_from_slice(&FrameHeader::new(frame_type, data.len() as u32).encode());
    buf.extend_from_slice(data);
    buf
}

/// Encode a message frame from its parts; used by servers and tests.
pub fn encode_message_frame(timestamp: i64, attempts: u16, id: &[u8; MESSAGE_ID_LENGTH], body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(MESSAGE_HEADER_SIZE + body.len());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(&attempts.to_be_bytes());
    data.extend_from_slice(id);
    data.extend_from_slice(body);
    encode_frame(FrameType::Message, &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let original = FrameHeader::new(FrameType::Message, 100);
        let decoded = FrameHeader::decode(&original.encode(), DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_size_includes_type_field() {
        let bytes = FrameHeader::new(FrameType::Error, 0x0102).encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0x01, 0x06]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(FrameHeader::decode(&[0u8; 7], DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_rejects_bad_size() {
        let tiny = [0, 0, 0, 3, 0, 0, 0, 0];
        assert!(FrameHeader::decode(&tiny, DEFAULT_MAX_FRAME_SIZE).is_err());

        let big = FrameHeader::new(FrameType::Response, 1000).encode();
        let err = FrameHeader::decode(&big, 100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let bytes = [0, 0, 0, 4, 0, 0, 0, 9];
        let err = FrameHeader::decode(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(err.to_string().contains("unknown frame type 9"));
    }

    #[test]
    fn test_fatal_error_codes() {
        assert!(!is_fatal_error_code("E_FIN_FAILED"));
        assert!(!is_fatal_error_code("E_REQ_FAILED"));
        assert!(!is_fatal_error_code("E_TOUCH_FAILED"));
        assert!(is_fatal_error_code("E_INVALID"));
        assert!(is_fatal_error_code("E_BAD_MESSAGE"));
        assert!(is_fatal_error_code(""));
    }

    #[test]
    fn test_message_frame_layout() {
        let frame = encode_message_frame(7, 2, b"0123456789abcdef", b"hi");
        assert_eq!(frame.len(), HEADER_SIZE + MESSAGE_HEADER_SIZE + 2);
        assert_eq!(&frame[4..8], &[0, 0, 0, 2]);
        assert_eq!(&frame[8..16], &7i64.to_be_bytes());
        assert_eq!(&frame[16..18], &[0, 2]);
        assert_eq!(&frame[18..34], b"0123456789abcdef");
        assert_eq!(&frame[34..], b"hi");
    }
}
