//! Topic and channel name rules.

use crate::error::{NsqError, Result};

/// Longest topic or channel name the server accepts.
pub const MAX_NAME_LENGTH: usize = 64;

/// Suffix marking a topic or channel as ephemeral.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Check a topic name.
pub fn validate_topic_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(NsqError::InvalidName(format!("topic {:?}", name)))
    }
}

/// Check a channel name.
pub fn validate_channel_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(NsqError::InvalidName(format!("channel {:?}", name)))
    }
}

/// Fit `name` into [`MAX_NAME_LENGTH`] bytes.
///
/// Short names come back unchanged. Longer names are truncated and get
/// `-` plus the 8-digit hex CRC-32 of the full name appended, ahead of any
/// `#ephemeral` suffix, so distinct long names stay distinct.
///
/// ```
/// use nsq_client::protocol::shorten_name;
///
/// let long = "a".repeat(100);
/// let short = shorten_name(&long);
/// assert_eq!(short.len(), 64);
/// assert_eq!(shorten_name("orders"), "orders");
/// ```
pub fn shorten_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LENGTH {
        return name.to_string();
    }

    let (base, suffix) = match name.strip_suffix(EPHEMERAL_SUFFIX) {
        Some(base) => (base, EPHEMERAL_SUFFIX),
        None => (name, ""),
    };
    let checksum = format!("-{:08x}", crc32fast::hash(name.as_bytes()));

    let mut keep = MAX_NAME_LENGTH.saturating_sub(checksum.len() + suffix.len());
    while !base.is_char_boundary(keep) {
        keep -= 1;
    }

    let mut short = String::with_capacity(MAX_NAME_LENGTH);
    short.push_str(&base[..keep]);
    short.push_str(&checksum);
    short.push_str(suffix);
    short
}
