//! Protocol module - wire format, framing, commands and names.
//!
//! This module implements the V2 TCP protocol:
//! - 8-byte frame header (size + type) encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors and message decoding
//! - Command encoding
//! - Topic/channel name validation and shortening

mod command;
mod frame;
mod frame_buffer;
mod names;
mod wire_format;

pub use command::Command;
pub use frame::{DecodedMessage, Frame};
pub use frame_buffer::FrameBuffer;
pub use names::{
    shorten_name, validate_channel_name, validate_topic_name, EPHEMERAL_SUFFIX, MAX_NAME_LENGTH,
};
pub use wire_format::{
    encode_frame, encode_message_frame, is_fatal_error_code, FrameHeader, FrameType,
    CLOSE_WAIT, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, HEARTBEAT, MAGIC_V2, MESSAGE_HEADER_SIZE,
    MESSAGE_ID_LENGTH, NON_FATAL_ERROR_CODES, OK,
};
