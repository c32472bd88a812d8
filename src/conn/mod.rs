//! A single connection to an nsqd.
//!
//! [`Connection::connect`] dials, writes the protocol magic and negotiates
//! features with IDENTIFY (optionally upgrading to TLS, enabling deflate and
//! sending AUTH). Once ready, two tasks run for the life of the connection:
//!
//! - the read loop, which answers heartbeats, pairs responses with pending
//!   requests, classifies error frames and turns message frames into
//!   [`Message`]s on the [`messages`](Connection::messages) channel
//! - the writer task (see [`writer`]), which owns the socket's write half
//!
//! Lifecycle transitions are reported on the [`events`](Connection::events)
//! channel. A closed connection is never reused; reconnecting means calling
//! [`Connection::connect`] again.

mod compress;
mod identify;
mod reader;
pub(crate) mod tls;
mod transport;
mod writer;

pub use identify::{AuthResponse, IdentifyRequest, IdentifyResponse, DEFAULT_MAX_RDY_COUNT};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::chan::Channel;
use crate::config::Config;
use crate::error::{NsqError, Result};
use crate::message::{Message, MessageId};
use crate::protocol::{validate_channel_name, validate_topic_name, Command, Frame, FrameType, MAGIC_V2};
use compress::Deflater;
use reader::FrameReader;
use transport::BoxedStream;
use writer::{spawn_writer_task, OutboundFrame, ReplyQueue, WriterConfig, WriterHandle};

/// Capacity of the lifecycle event channel. Events beyond it are dropped.
const EVENT_CAPACITY: usize = 64;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    /// Dialing and writing the protocol magic.
    Connecting = 0,
    /// IDENTIFY (and TLS/deflate/AUTH) in progress.
    Identifying = 1,
    /// Handshake complete; commands may be sent.
    Ready = 2,
    /// Close started; no new commands are accepted.
    Closing = 3,
    /// Socket closed and all channels closed.
    Closed = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Identifying,
            2 => ConnState::Ready,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Lifecycle notifications emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// Handshake finished.
    Connected,
    /// A heartbeat was answered with NOP.
    Heartbeat,
    /// The server acknowledged CLS and will send no more messages.
    CloseWait,
    /// A server or transport error; fatal ones are followed by `Closing`.
    Error(String),
    /// Close started.
    Closing,
    /// Socket closed; this is the last event.
    Closed,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<Result<()>>>,
}

/// FIN and REQ commands sent, however the message was completed.
#[derive(Debug, Default)]
pub(crate) struct Completions {
    pub(crate) finished: AtomicU64,
    pub(crate) requeued: AtomicU64,
}

/// State shared by a connection's handles, its tasks and its messages.
pub(crate) struct ConnShared {
    address: Arc<str>,
    config: Arc<Config>,
    identify: IdentifyResponse,
    auth: Option<AuthResponse>,
    state: AtomicU8,
    writer: WriterHandle,
    replies: ReplyQueue,
    /// Message id -> attempt count of the delivery being tracked.
    in_flight: Mutex<HashMap<MessageId, u16>>,
    completions: Arc<Completions>,
    rdy: AtomicU32,
    rdy_remaining: AtomicU32,
    last_message: Mutex<Option<Instant>>,
    rdy_changed: Mutex<Instant>,
    messages: Channel<Message>,
    events: Channel<ConnEvent>,
    closed: Channel<()>,
    tasks: Mutex<Tasks>,
}

impl ConnShared {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state() >= ConnState::Closing
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Send a completion command for a tracked delivery.
    ///
    /// Fails with [`NsqError::NotInFlight`] if `id` is not tracked with the
    /// same attempt count (already completed, or redelivered since). With
    /// `complete` the delivery stops being tracked.
    pub(crate) async fn respond(&self, id: &MessageId, attempts: u16, cmd: Command, complete: bool) -> Result<()> {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(id) {
                Some(tracked) if *tracked == attempts => {}
                _ => return Err(NsqError::NotInFlight(id.to_string())),
            }
            if complete {
                in_flight.remove(id);
            }
        }
        let name = cmd.name();
        self.send(cmd).await?;
        match name {
            "FIN" => self.completions.finished.fetch_add(1, Ordering::Relaxed),
            "REQ" => self.completions.requeued.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        Ok(())
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        if self.is_closing() {
            return Err(NsqError::ConnectionClosed);
        }
        self.writer.send(OutboundFrame::new(cmd)).await
    }

    fn emit(&self, event: ConnEvent) {
        if self.events.try_send(event).is_err() {
            tracing::debug!("{}: lifecycle event dropped", self.address);
        }
    }

    fn fail_replies(&self) {
        let pending: Vec<_> = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for reply in pending {
            let _ = reply.send(Err(NsqError::ConnectionClosed));
        }
    }

    fn fail(self: &Arc<Self>, err: NsqError) {
        if !self.is_closing() {
            tracing::error!("{}: connection error: {}", self.address, err);
            self.emit(ConnEvent::Error(err.to_string()));
        }
        self.close();
    }

    fn close(self: &Arc<Self>) {
        let started = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ConnState::Closing as u8).then_some(ConnState::Closing as u8)
            })
            .is_ok();
        if !started {
            return;
        }

        tracing::info!("{}: closing connection", self.address);
        self.emit(ConnEvent::Closing);
        self.writer.close();
        self.fail_replies();
        self.messages.close();

        let (reader, writer) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            (tasks.reader.take(), tasks.writer.take())
        };
        if let Some(reader) = reader {
            reader.abort();
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(writer) = writer {
                match tokio::time::timeout(shared.config.write_timeout * 2, writer).await {
                    Ok(Ok(Err(e))) => tracing::debug!("{}: writer stopped: {}", shared.address, e),
                    Ok(_) => {}
                    Err(_) => tracing::warn!("{}: writer did not drain in time", shared.address),
                }
            }
            shared.fail_replies();
            shared.state.store(ConnState::Closed as u8, Ordering::Release);
            tracing::info!("{}: connection closed", shared.address);
            shared.emit(ConnEvent::Closed);
            shared.events.close();
            shared.closed.close();
        });
    }

    async fn read_loop<R>(self: Arc<Self>, mut stream: R, mut reader: FrameReader)
    where
        R: AsyncRead + Unpin,
    {
        match self.read_frames(&mut stream, &mut reader).await {
            Ok(()) => {
                if !self.is_closing() {
                    tracing::info!("{}: server closed the connection", self.address);
                }
                self.close();
            }
            Err(e) => self.fail(e),
        }
    }

    async fn read_frames<R>(self: &Arc<Self>, stream: &mut R, reader: &mut FrameReader) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = match self.config.heartbeat_interval {
            Some(interval) => interval * 2,
            None => self.config.read_timeout,
        };

        loop {
            let frame = match tokio::time::timeout(deadline, reader.read_frame(stream)).await {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(NsqError::Timeout(format!(
                        "no data from {} in {:?}",
                        self.address, deadline
                    )))
                }
            };

            match frame.frame_type {
                FrameType::Response if frame.is_heartbeat() => {
                    tracing::debug!("{}: heartbeat", self.address);
                    self.send(Command::nop()).await?;
                    self.emit(ConnEvent::Heartbeat);
                }
                FrameType::Response if frame.is_close_wait() => {
                    tracing::info!("{}: received CLOSE_WAIT", self.address);
                    self.emit(ConnEvent::CloseWait);
                }
                FrameType::Response => self.deliver_reply(Ok(frame)),
                FrameType::Error => {
                    let err = frame.to_error();
                    if err.is_fatal() {
                        self.deliver_reply(Err(frame.to_error()));
                        return Err(err);
                    }
                    tracing::warn!("{}: {}", self.address, err);
                    self.emit(ConnEvent::Error(err.to_string()));
                }
                FrameType::Message => {
                    let msg = self.track_message(&frame)?;
                    if self.messages.send(msg).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn deliver_reply(&self, result: Result<Frame>) {
        let reply = self.replies.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => tracing::warn!("{}: response with no pending request", self.address),
        }
    }

    fn track_message(self: &Arc<Self>, frame: &Frame) -> Result<Message> {
        let decoded = frame.decode_message()?;
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(decoded.id, decoded.attempts);
        let _ = self
            .rdy_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        *self.last_message.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        Ok(Message::new(
            decoded.id,
            decoded.body,
            decoded.timestamp,
            decoded.attempts,
            Arc::clone(&self.address),
            Arc::downgrade(self),
            self.identify.msg_timeout().or(self.config.msg_timeout),
        ))
    }
}

/// Handle to a connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("rdy", &self.rdy())
            .finish()
    }
}

/// Result of a successful handshake.
struct Negotiated {
    stream: BoxedStream,
    reader: FrameReader,
    deflater: Option<Deflater>,
    identify: IdentifyResponse,
    auth: Option<AuthResponse>,
}

impl Connection {
    /// Dial `addr`, run the handshake and start the connection's tasks.
    ///
    /// The handshake (everything after the TCP connect) is bounded by
    /// `read_timeout`.
    pub async fn connect(addr: &str, config: Arc<Config>) -> Result<Self> {
        Self::connect_counted(addr, config, Arc::default()).await
    }

    /// [`connect`](Self::connect), counting completions into `completions`.
    pub(crate) async fn connect_counted(addr: &str, config: Arc<Config>, completions: Arc<Completions>) -> Result<Self> {
        tracing::debug!("{}: connecting", addr);
        let tcp = transport::dial(addr, config.dial_timeout).await?;
        let negotiated = tokio::time::timeout(config.read_timeout, handshake(Box::new(tcp), addr, &config))
            .await
            .map_err(|_| NsqError::Timeout(format!("handshake with {} timed out", addr)))??;

        let Negotiated {
            stream,
            reader,
            deflater,
            identify,
            auth,
        } = negotiated;

        let (read_half, write_half) = tokio::io::split(stream);
        let replies: ReplyQueue = Arc::new(Mutex::new(VecDeque::new()));
        let (writer, writer_task) = spawn_writer_task(
            write_half,
            deflater,
            Arc::clone(&replies),
            WriterConfig {
                channel_capacity: writer::DEFAULT_CHANNEL_CAPACITY,
                write_timeout: config.write_timeout,
            },
        );

        let message_capacity = config.max_in_flight.clamp(1, identify.max_rdy_count.max(1)) as usize;
        let shared = Arc::new(ConnShared {
            address: Arc::from(addr),
            config,
            identify,
            auth,
            state: AtomicU8::new(ConnState::Ready as u8),
            writer,
            replies,
            in_flight: Mutex::new(HashMap::new()),
            completions,
            rdy: AtomicU32::new(0),
            rdy_remaining: AtomicU32::new(0),
            last_message: Mutex::new(None),
            rdy_changed: Mutex::new(Instant::now()),
            messages: Channel::new(message_capacity),
            events: Channel::new(EVENT_CAPACITY),
            closed: Channel::new(0),
            tasks: Mutex::new(Tasks {
                reader: None,
                writer: Some(writer_task),
            }),
        });

        let read_task = tokio::spawn(Arc::clone(&shared).read_loop(read_half, reader));
        {
            let mut tasks = shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if shared.is_closing() {
                read_task.abort();
            } else {
                tasks.reader = Some(read_task);
            }
        }

        tracing::info!(
            "{}: connected (server version {:?}, max_rdy_count {})",
            addr,
            shared.identify.version,
            shared.identify.max_rdy_count
        );
        shared.emit(ConnEvent::Connected);
        Ok(Self { shared })
    }

    /// Remote address as given to [`connect`](Self::connect).
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// Whether close has started.
    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    /// Features negotiated during IDENTIFY.
    pub fn identify_response(&self) -> &IdentifyResponse {
        &self.shared.identify
    }

    /// Identity returned by AUTH, if the server required it.
    pub fn auth_response(&self) -> Option<&AuthResponse> {
        self.shared.auth.as_ref()
    }

    /// Largest RDY count the server accepts.
    pub fn max_rdy_count(&self) -> u32 {
        self.shared.identify.max_rdy_count
    }

    /// Subscribe to `topic`/`channel` and wait for the server's `OK`.
    pub async fn subscribe(&self, topic: &str, channel: &str) -> Result<()> {
        validate_topic_name(topic)?;
        validate_channel_name(channel)?;
        let frame = self.request(Command::subscribe(topic, channel)).await?;
        if !frame.is_ok() {
            return Err(NsqError::Protocol(format!(
                "unexpected SUB response {:?}",
                String::from_utf8_lossy(frame.payload())
            )));
        }
        tracing::info!("{}: subscribed to {}/{}", self.address(), topic, channel);
        Ok(())
    }

    /// Advertise readiness for `count` messages.
    ///
    /// `count` is clamped to [`max_rdy_count`](Self::max_rdy_count); the
    /// value actually sent is returned.
    pub async fn set_rdy(&self, count: u32) -> Result<u32> {
        let count = count.min(self.max_rdy_count());
        self.shared.send(Command::ready(count)).await?;
        if self.shared.rdy.swap(count, Ordering::AcqRel) != count {
            *self.shared.rdy_changed.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        }
        self.shared.rdy_remaining.store(count, Ordering::Release);
        tracing::debug!("{}: RDY {}", self.address(), count);
        Ok(count)
    }

    /// Last RDY count sent.
    pub fn rdy(&self) -> u32 {
        self.shared.rdy.load(Ordering::Acquire)
    }

    /// Messages the server may still send under the last RDY.
    pub fn rdy_remaining(&self) -> u32 {
        self.shared.rdy_remaining.load(Ordering::Acquire)
    }

    /// When the last message arrived.
    pub fn last_message_at(&self) -> Option<Instant> {
        *self.shared.last_message.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Time of the last message, or of the last RDY change if later.
    pub fn last_activity(&self) -> Instant {
        let changed = *self.shared.rdy_changed.lock().unwrap_or_else(|e| e.into_inner());
        self.last_message_at().map_or(changed, |m| m.max(changed))
    }

    /// Deliveries not yet finished or requeued.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Queue a command without waiting for a response.
    ///
    /// Commands the server answers (SUB, PUB, ...) must go through
    /// [`request`](Self::request) so their response is paired.
    pub async fn command(&self, cmd: Command) -> Result<()> {
        if cmd.expects_reply() {
            return Err(NsqError::Protocol(format!("{} expects a response; use request", cmd.name())));
        }
        self.shared.send(cmd).await
    }

    /// Send a command and wait for its response frame.
    ///
    /// Waits at most `read_timeout`; a timeout leaves the response stream in
    /// an unknown position, so it closes the connection. Commands the server
    /// never answers are rejected.
    pub async fn request(&self, cmd: Command) -> Result<Frame> {
        if !cmd.expects_reply() {
            return Err(NsqError::Protocol(format!("{} has no response; use command", cmd.name())));
        }
        if self.is_closing() {
            return Err(NsqError::ConnectionClosed);
        }
        let name = cmd.name();
        let (tx, rx) = oneshot::channel();
        self.shared.writer.send(OutboundFrame::with_reply(cmd, tx)).await?;

        let timeout = self.shared.config.read_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NsqError::ConnectionClosed),
            Err(_) => {
                let err = NsqError::Timeout(format!("no response to {} from {} in {:?}", name, self.address(), timeout));
                self.shared.fail(NsqError::Timeout(format!("{} response", name)));
                Err(err)
            }
        }
    }

    /// Send CLS: the server stops delivering and answers `CLOSE_WAIT`.
    pub async fn start_close(&self) -> Result<()> {
        self.shared.send(Command::close()).await
    }

    /// Close the connection. Idempotent.
    ///
    /// Queued commands are still written; pending requests fail with
    /// [`NsqError::ConnectionClosed`]; the message channel closes at once and
    /// the event channel after `Closed`.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Wait until the connection is fully closed.
    pub async fn closed(&self) {
        let _ = self.shared.closed.recv().await;
    }

    /// Delivered messages. Closes when the connection closes.
    pub fn messages(&self) -> &Channel<Message> {
        &self.shared.messages
    }

    /// Lifecycle events. Closes after `Closed`.
    pub fn events(&self) -> &Channel<ConnEvent> {
        &self.shared.events
    }
}

async fn handshake(mut stream: BoxedStream, addr: &str, config: &Config) -> Result<Negotiated> {
    let mut reader = FrameReader::new();
    stream.write_all(MAGIC_V2).await?;

    let body = IdentifyRequest::from_config(config).to_json()?;
    write_command(&mut stream, None, Command::identify(Bytes::from(body))).await?;
    let frame = read_response(&mut stream, &mut reader, "IDENTIFY").await?;
    let identify = IdentifyResponse::parse(frame.payload())
        .map_err(|e| NsqError::Handshake(format!("bad IDENTIFY response from {}: {}", addr, e)))?;
    tracing::debug!("{}: IDENTIFY response {:?}", addr, identify);

    if identify.snappy {
        return Err(NsqError::Handshake(format!("{} enabled snappy, which is not supported", addr)));
    }
    match (&config.tls, identify.tls_v1) {
        (None, true) => {
            return Err(NsqError::Handshake(format!("{} enabled TLS without being asked", addr)))
        }
        (Some(_), false) => {
            return Err(NsqError::Handshake(format!("{} refused TLS", addr)))
        }
        _ => {}
    }
    if identify.deflate && !config.deflate {
        return Err(NsqError::Handshake(format!("{} enabled deflate without being asked", addr)));
    }
    if config.deflate && !identify.deflate {
        tracing::warn!("{}: deflate requested but not enabled by server", addr);
    }

    if let (Some(tls), true) = (&config.tls, identify.tls_v1) {
        if reader.has_buffered() {
            return Err(NsqError::Protocol(format!("{} sent data before TLS upgrade", addr)));
        }
        stream = tls::upgrade(stream, transport::host_of(addr), tls).await?;
        expect_ok(&mut stream, &mut reader, "TLS").await?;
    }

    let mut deflater = None;
    if identify.deflate {
        reader.enable_deflate()?;
        let level = if identify.deflate_level > 0 {
            identify.deflate_level
        } else {
            config.deflate_level
        };
        deflater = Some(Deflater::new(level));
        expect_ok(&mut stream, &mut reader, "deflate").await?;
    }

    let mut auth = None;
    if identify.auth_required {
        let secret = config
            .auth_secret
            .as_deref()
            .ok_or_else(|| NsqError::Handshake(format!("{} requires AUTH but no secret is configured", addr)))?;
        write_command(&mut stream, deflater.as_mut(), Command::auth(secret)).await?;
        let frame = read_response(&mut stream, &mut reader, "AUTH").await?;
        let resp = AuthResponse::parse(frame.payload())?;
        tracing::info!(
            "{}: authenticated as {:?} ({} permissions)",
            addr,
            resp.identity,
            resp.permission_count
        );
        auth = Some(resp);
    }

    Ok(Negotiated {
        stream,
        reader,
        deflater,
        identify,
        auth,
    })
}

async fn write_command(stream: &mut BoxedStream, deflater: Option<&mut Deflater>, cmd: Command) -> Result<()> {
    let (head, body) = cmd.into_parts();
    match deflater {
        Some(deflater) => stream.write_all(&deflater.deflate(&[&head[..], &body[..]])?).await?,
        None => {
            stream.write_all(&head).await?;
            stream.write_all(&body).await?;
        }
    }
    stream.flush().await?;
    Ok(())
}

/// Next non-heartbeat frame during the handshake; error frames become errors.
async fn read_response(stream: &mut BoxedStream, reader: &mut FrameReader, step: &str) -> Result<Frame> {
    loop {
        let frame = reader
            .read_frame(stream)
            .await?
            .ok_or_else(|| NsqError::Handshake(format!("connection closed during {}", step)))?;
        match frame.frame_type {
            FrameType::Response if frame.is_heartbeat() => continue,
            FrameType::Response => return Ok(frame),
            FrameType::Error => return Err(frame.to_error()),
            FrameType::Message => {
                return Err(NsqError::Protocol(format!("message frame during {}", step)))
            }
        }
    }
}

async fn expect_ok(stream: &mut BoxedStream, reader: &mut FrameReader, step: &str) -> Result<()> {
    let frame = read_response(stream, reader, step).await?;
    if !frame.is_ok() {
        return Err(NsqError::Handshake(format!(
            "expected OK after {}, got {:?}",
            step,
            String::from_utf8_lossy(frame.payload())
        )));
    }
    Ok(())
}
