//! Publishing to a single nsqd.
//!
//! A [`Producer`] owns one [`Connection`], dialed on the first publish (or by
//! [`Producer::connect`]) and redialed on the next publish if it drops. Every
//! publish waits for the server's response to that exact command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::conn::Connection;
use crate::error::{NsqError, Result};
use crate::protocol::{validate_topic_name, Command};

/// Publishes messages to one nsqd. Cheap to clone.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    addr: String,
    config: Arc<Config>,
    /// Publishes hold a read guard for the whole round trip, so `stop`
    /// taking the write guard waits for them.
    conn: RwLock<Option<Connection>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("addr", &self.inner.addr)
            .field("stopped", &self.inner.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl Producer {
    /// Create a producer for the nsqd at `addr`. Nothing is dialed yet.
    pub fn new(addr: &str, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ProducerInner {
                addr: addr.to_string(),
                config: Arc::new(config),
                conn: RwLock::new(None),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.addr
    }

    /// Dial now instead of on the first publish.
    pub async fn connect(&self) -> Result<()> {
        let _conn = self.connection().await?;
        Ok(())
    }

    /// Publish one message and wait for the server to accept it.
    pub async fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        validate_topic_name(topic)?;
        self.send(Command::publish(topic, body.into())).await
    }

    /// Publish several messages in one command.
    pub async fn multi_publish(&self, topic: &str, bodies: &[Bytes]) -> Result<()> {
        validate_topic_name(topic)?;
        if bodies.is_empty() {
            return Err(NsqError::Publish("no message bodies".to_string()));
        }
        self.send(Command::multi_publish(topic, bodies)).await
    }

    /// Publish a message the server delivers after `delay`.
    pub async fn deferred_publish(&self, topic: &str, delay: Duration, body: impl Into<Bytes>) -> Result<()> {
        validate_topic_name(topic)?;
        self.send(Command::deferred_publish(topic, delay, body.into())).await
    }

    /// Check that the server is reachable, dialing if needed.
    pub async fn ping(&self) -> Result<()> {
        let guard = self.connection().await?;
        match guard.as_ref() {
            Some(conn) => conn.command(Command::nop()).await,
            None => Err(NsqError::ConnectionClosed),
        }
    }

    /// Close the connection once in-flight publishes have their answer.
    ///
    /// Later publishes fail with [`NsqError::Publish`]. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.inner.conn.write().await.take();
        if let Some(conn) = conn {
            tracing::info!("{}: stopping producer", self.inner.addr);
            conn.close();
            conn.closed().await;
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        let name = cmd.name();
        let guard = self.connection().await.map_err(publish_error)?;
        let Some(conn) = guard.as_ref() else {
            return Err(NsqError::Publish("not connected".to_string()));
        };

        let frame = conn.request(cmd).await.map_err(publish_error)?;
        if frame.is_ok() {
            Ok(())
        } else {
            Err(NsqError::Publish(format!(
                "unexpected {} response: {}",
                name,
                String::from_utf8_lossy(frame.payload())
            )))
        }
    }

    /// A read guard over a live connection, dialing first if there is none.
    async fn connection(&self) -> Result<tokio::sync::RwLockReadGuard<'_, Option<Connection>>> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(NsqError::Stopped);
        }
        {
            let guard = self.inner.conn.read().await;
            if guard.as_ref().is_some_and(|c| !c.is_closing()) {
                return Ok(guard);
            }
        }

        let mut guard = self.inner.conn.write().await;
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(NsqError::Stopped);
        }
        if !guard.as_ref().is_some_and(|c| !c.is_closing()) {
            tracing::debug!("{}: dialing for publish", self.inner.addr);
            let conn = Connection::connect(&self.inner.addr, Arc::clone(&self.inner.config)).await?;
            *guard = Some(conn);
        }
        Ok(guard.downgrade())
    }
}

fn publish_error(err: NsqError) -> NsqError {
    match err {
        NsqError::Publish(_) => err,
        NsqError::Stopped => NsqError::Publish("producer stopped".to_string()),
        other => NsqError::Publish(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config() -> Config {
        Config {
            heartbeat_interval: None,
            read_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    async fn read_line(socket: &mut TcpStream) -> String {
        let mut line = Vec::new();
        loop {
            let b = socket.read_u8().await.unwrap();
            if b == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(b);
        }
    }

    async fn read_body(socket: &mut TcpStream) -> Vec<u8> {
        let len = socket.read_u32().await.unwrap() as usize;
        let mut body = vec![0; len];
        socket.read_exact(&mut body).await.unwrap();
        body
    }

    async fn write_frame(socket: &mut TcpStream, frame_type: u32, data: &[u8]) {
        socket.write_u32(data.len() as u32 + 4).await.unwrap();
        socket.write_u32(frame_type).await.unwrap();
        socket.write_all(data).await.unwrap();
    }

    /// Accepts one connection, completes the handshake and answers each
    /// publish with `reply`. Returns the received command lines and bodies.
    async fn nsqd(reply: &'static [u8], frame_type: u32) -> (String, tokio::task::JoinHandle<Vec<(String, Vec<u8>)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut magic = [0u8; 4];
            socket.read_exact(&mut magic).await.unwrap();
            assert_eq!(&magic, b"  V2");
            assert_eq!(read_line(&mut socket).await, "IDENTIFY");
            read_body(&mut socket).await;
            write_frame(&mut socket, 0, br#"{"max_rdy_count":2500}"#).await;

            let mut seen = Vec::new();
            loop {
                let line = match tokio::time::timeout(Duration::from_secs(5), read_line(&mut socket)).await {
                    Ok(line) => line,
                    Err(_) => break,
                };
                let body = if line.starts_with("PUB") || line.starts_with("MPUB") || line.starts_with("DPUB") {
                    let body = read_body(&mut socket).await;
                    write_frame(&mut socket, frame_type, reply).await;
                    body
                } else {
                    Vec::new()
                };
                let done = line == "CLS";
                seen.push((line, body));
                if done || socket.peek(&mut [0u8; 1]).await.unwrap_or(0) == 0 {
                    break;
                }
            }
            seen
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_publish_waits_for_ok() {
        let (addr, server) = nsqd(b"OK", 0).await;
        let producer = Producer::new(&addr, config()).unwrap();

        producer.publish("t", &b"Hello!"[..]).await.unwrap();
        producer.stop().await;

        let seen = server.await.unwrap();
        assert_eq!(seen[0], ("PUB t".to_string(), b"Hello!".to_vec()));
    }

    #[tokio::test]
    async fn test_publish_after_stop_fails() {
        let (addr, _server) = nsqd(b"OK", 0).await;
        let producer = Producer::new(&addr, config()).unwrap();
        producer.connect().await.unwrap();
        producer.stop().await;
        producer.stop().await;

        let err = producer.publish("t", &b"late"[..]).await.unwrap_err();
        assert!(matches!(err, NsqError::Publish(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_server_error_is_publish_error() {
        let (addr, _server) = nsqd(b"E_BAD_TOPIC bad topic", 1).await;
        let producer = Producer::new(&addr, config()).unwrap();
        let err = producer.publish("t", &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, NsqError::Publish(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_multi_publish_and_deferred() {
        let (addr, server) = nsqd(b"OK", 0).await;
        let producer = Producer::new(&addr, config()).unwrap();

        let bodies = [Bytes::from_static(b"a"), Bytes::from_static(b"bc")];
        producer.multi_publish("t", &bodies).await.unwrap();
        producer
            .deferred_publish("t", Duration::from_millis(1500), &b"later"[..])
            .await
            .unwrap();
        producer.stop().await;

        let seen = server.await.unwrap();
        assert_eq!(seen[0].0, "MPUB t");
        assert_eq!(&seen[0].1[..4], &2u32.to_be_bytes());
        assert_eq!(seen[1], ("DPUB t 1500".to_string(), b"later".to_vec()));
    }

    #[tokio::test]
    async fn test_invalid_topic_never_dials() {
        let producer = Producer::new("127.0.0.1:1", config()).unwrap();
        let err = producer.publish("bad topic!", &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, NsqError::InvalidName(_)));
        assert!(producer.multi_publish("t", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_is_publish_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let producer = Producer::new(&addr, config()).unwrap();
        let err = producer.publish("t", &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, NsqError::Publish(_)));
    }
}
