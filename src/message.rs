//! Delivered messages and their completion protocol.
//!
//! A [`Message`] is created by a connection's read loop and handed to a
//! handler. Exactly one of [`finish`](Message::finish) or
//! [`requeue`](Message::requeue) reaches the wire per delivery; a second
//! attempt fails with [`NsqError::AlreadyResponded`]. [`touch`](Message::touch)
//! may be sent any number of times before that.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::conn::ConnShared;
use crate::error::{NsqError, Result};
use crate::protocol::{Command, MESSAGE_ID_LENGTH};

/// 16-byte message id as sent by the server (ASCII hex).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    /// Wrap raw id bytes.
    pub fn new(bytes: [u8; MESSAGE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

struct MessageInner {
    id: MessageId,
    body: Bytes,
    timestamp: i64,
    attempts: AtomicU16,
    delivered_attempts: u16,
    address: Arc<str>,
    conn: Weak<ConnShared>,
    responded: AtomicBool,
    backoff_neutral: AtomicBool,
    touched_at: Mutex<Instant>,
    msg_timeout: Option<Duration>,
}

/// A message delivered on a connection.
///
/// Cheap to clone; clones share completion state.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.inner.id)
            .field("attempts", &self.attempts())
            .field("address", &self.inner.address)
            .field("body_len", &self.inner.body.len())
            .finish()
    }
}

impl Message {
    pub(crate) fn new(
        id: MessageId,
        body: Bytes,
        timestamp: i64,
        attempts: u16,
        address: Arc<str>,
        conn: Weak<ConnShared>,
        msg_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                id,
                body,
                timestamp,
                attempts: AtomicU16::new(attempts),
                delivered_attempts: attempts,
                address,
                conn,
                responded: AtomicBool::new(false),
                backoff_neutral: AtomicBool::new(false),
                touched_at: Mutex::new(Instant::now()),
                msg_timeout,
            }),
        }
    }

    /// Message id.
    pub fn id(&self) -> MessageId {
        self.inner.id
    }

    /// Message body.
    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    /// Server receive time in nanoseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.inner.timestamp
    }

    /// Delivery attempts, including a local requeue if one was sent.
    pub fn attempts(&self) -> u16 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    /// Address of the connection the message arrived on.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Whether FIN or REQ has been sent for this delivery.
    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    pub(crate) fn is_backoff_neutral(&self) -> bool {
        self.inner.backoff_neutral.load(Ordering::Acquire)
    }

    /// When the server will consider this delivery timed out, if known.
    pub fn deadline(&self) -> Option<Instant> {
        let touched = *self.inner.touched_at.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.msg_timeout.map(|t| touched + t)
    }

    /// Acknowledge successful processing.
    pub async fn finish(&self) -> Result<()> {
        let conn = self.connection()?;
        self.claim_response()?;
        let result = conn
            .respond(&self.inner.id, self.inner.delivered_attempts, Command::finish(&self.inner.id), true)
            .await;
        self.release_on_error(result)
    }

    /// Ask the server to redeliver after `delay`.
    ///
    /// With `None` the delay grows with the attempt count, from the
    /// configured default requeue delay, clamped to the requeue bounds.
    pub async fn requeue(&self, delay: Option<Duration>) -> Result<()> {
        let conn = self.connection()?;
        let config = conn.config();
        let delay = match delay {
            Some(d) => d.clamp(config.min_requeue_delay, config.max_requeue_delay),
            None => config.requeue_delay(self.attempts()),
        };
        self.send_requeue(&conn, delay).await
    }

    /// Requeue with an explicit delay without affecting consumer backoff.
    ///
    /// The consumer treats a message requeued this way as neither a success
    /// nor a failure.
    pub async fn requeue_without_backoff(&self, delay: Duration) -> Result<()> {
        let conn = self.connection()?;
        self.send_requeue(&conn, delay).await?;
        self.inner.backoff_neutral.store(true, Ordering::Release);
        Ok(())
    }

    /// Reset the server-side timeout for this delivery.
    pub async fn touch(&self) -> Result<()> {
        if self.has_responded() {
            return Err(NsqError::AlreadyResponded(self.inner.id.to_string()));
        }
        let conn = self.connection()?;
        conn.respond(&self.inner.id, self.inner.delivered_attempts, Command::touch(&self.inner.id), false)
            .await?;
        *self.inner.touched_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Ok(())
    }

    async fn send_requeue(&self, conn: &ConnShared, delay: Duration) -> Result<()> {
        self.claim_response()?;
        let cmd = Command::requeue(&self.inner.id, delay);
        let result = conn.respond(&self.inner.id, self.inner.delivered_attempts, cmd, true).await;
        let result = self.release_on_error(result);
        if result.is_ok() {
            self.inner.attempts.fetch_add(1, Ordering::AcqRel);
        }
        result
    }

    fn connection(&self) -> Result<Arc<ConnShared>> {
        match self.inner.conn.upgrade() {
            Some(conn) if !conn.is_closing() => Ok(conn),
            _ => Err(NsqError::ConnectionClosed),
        }
    }

    fn claim_response(&self) -> Result<()> {
        self.inner
            .responded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| NsqError::AlreadyResponded(self.inner.id.to_string()))
    }

    /// Undo the claim when nothing reached the wire.
    fn release_on_error(&self, result: Result<()>) -> Result<()> {
        if let Err(NsqError::ConnectionClosed) = result {
            self.inner.responded.store(false, Ordering::Release);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan(attempts: u16) -> Message {
        Message::new(
            MessageId::new(*b"0123456789abcdef"),
            Bytes::from_static(b"body"),
            42,
            attempts,
            Arc::from("127.0.0.1:4150"),
            Weak::new(),
            Some(Duration::from_secs(60)),
        )
    }

    #[test]
    fn test_accessors() {
        let msg = orphan(3);
        assert_eq!(msg.id().to_string(), "0123456789abcdef");
        assert_eq!(&msg.body()[..], b"body");
        assert_eq!(msg.timestamp(), 42);
        assert_eq!(msg.attempts(), 3);
        assert_eq!(msg.address(), "127.0.0.1:4150");
        assert!(!msg.has_responded());
        assert!(msg.deadline().is_some());
    }

    #[tokio::test]
    async fn test_closed_connection_is_caller_error() {
        let msg = orphan(1);
        assert!(matches!(msg.finish().await, Err(NsqError::ConnectionClosed)));
        assert!(matches!(msg.requeue(None).await, Err(NsqError::ConnectionClosed)));
        assert!(matches!(msg.touch().await, Err(NsqError::ConnectionClosed)));
        assert!(!msg.has_responded());
        assert_eq!(msg.attempts(), 1);
    }

    #[test]
    fn test_message_id_formatting() {
        let id = MessageId::new(*b"deadbeefcafef00d");
        assert_eq!(id.to_string(), "deadbeefcafef00d");
        assert_eq!(format!("{:?}", id), "MessageId(deadbeefcafef00d)");
        assert_eq!(id.as_bytes(), b"deadbeefcafef00d");
    }
}
