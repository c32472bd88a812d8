//! Client command encoding.
//!
//! A command is a text line, optionally followed by a length-prefixed body:
//! ```text
//! NAME arg1 arg2\n[ 4-byte BE size ][ body ]
//! ```
//! [`Command::into_parts`] splits a command into a head (line and size
//! prefix) and a body so the writer can send both with one vectored write.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::MessageId;

/// An encoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    line: Bytes,
    body: Option<Bytes>,
}

impl Command {
    fn new(name: &'static str, params: &[&[u8]], body: Option<Bytes>) -> Self {
        let len = name.len() + params.iter().map(|p| p.len() + 1).sum::<usize>() + 1;
        let mut line = BytesMut::with_capacity(len);
        line.put_slice(name.as_bytes());
        for param in params {
            line.put_u8(b' ');
            line.put_slice(param);
        }
        line.put_u8(b'\n');
        Self {
            name,
            line: line.freeze(),
            body,
        }
    }

    /// `IDENTIFY` with a JSON body.
    pub fn identify(json: Bytes) -> Self {
        Self::new("IDENTIFY", &[], Some(json))
    }

    /// `AUTH` with the secret as body.
    pub fn auth(secret: &str) -> Self {
        Self::new("AUTH", &[], Some(Bytes::copy_from_slice(secret.as_bytes())))
    }

    /// `SUB <topic> <channel>`.
    pub fn subscribe(topic: &str, channel: &str) -> Self {
        Self::new("SUB", &[topic.as_bytes(), channel.as_bytes()], None)
    }

    /// `RDY <count>`.
    pub fn ready(count: u32) -> Self {
        Self::new("RDY", &[count.to_string().as_bytes()], None)
    }

    /// `FIN <id>`.
    pub fn finish(id: &MessageId) -> Self {
        Self::new("FIN", &[id.as_bytes()], None)
    }

    /// `REQ <id> <delay ms>`.
    pub fn requeue(id: &MessageId, delay: Duration) -> Self {
        let ms = delay.as_millis().to_string();
        Self::new("REQ", &[id.as_bytes(), ms.as_bytes()], None)
    }

    /// `TOUCH <id>`.
    pub fn touch(id: &MessageId) -> Self {
        Self::new("TOUCH", &[id.as_bytes()], None)
    }

    /// `PUB <topic>` with the message as body.
    pub fn publish(topic: &str, body: Bytes) -> Self {
        Self::new("PUB", &[topic.as_bytes()], Some(body))
    }

    /// `MPUB <topic>`; the body is the message count followed by each
    /// message's size and bytes.
    pub fn multi_publish(topic: &str, bodies: &[Bytes]) -> Self {
        let len = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32(bodies.len() as u32);
        for body in bodies {
            buf.put_u32(body.len() as u32);
            buf.put_slice(body);
        }
        Self::new("MPUB", &[topic.as_bytes()], Some(buf.freeze()))
    }

    /// `DPUB <topic> <defer ms>`.
    pub fn deferred_publish(topic: &str, delay: Duration, body: Bytes) -> Self {
        let ms = delay.as_millis().to_string();
        Self::new("DPUB", &[topic.as_bytes(), ms.as_bytes()], Some(body))
    }

    /// `NOP`.
    pub fn nop() -> Self {
        Self::new("NOP", &[], None)
    }

    /// `CLS`: ask the server to stop sending messages.
    pub fn close() -> Self {
        Self::new("CLS", &[], None)
    }

    /// Command name, e.g. `"PUB"`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the server answers this command with a response or error frame.
    ///
    /// CLS is answered with `CLOSE_WAIT`, which is routed as an event instead.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self.name,
            "IDENTIFY" | "AUTH" | "SUB" | "PUB" | "MPUB" | "DPUB"
        )
    }

    /// Total encoded length.
    #[cfg(test)]
    pub(crate) fn encoded_len(&self) -> usize {
        self.line.len() + self.body.as_ref().map_or(0, |b| 4 + b.len())
    }

    /// Split into head (line plus size prefix) and body.
    pub fn into_parts(self) -> (Bytes, Bytes) {
        match self.body {
            None => (self.line, Bytes::new()),
            Some(body) => {
                let mut head = BytesMut::with_capacity(self.line.len() + 4);
                head.put_slice(&self.line);
                head.put_u32(body.len() as u32);
                (head.freeze(), body)
            }
        }
    }

    /// Encode into one contiguous buffer.
    #[cfg(test)]
    pub(crate) fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.line);
        if let Some(body) = &self.body {
            buf.put_u32(body.len() as u32);
            buf.put_slice(body);
        }
        buf.freeze()
    }
}
