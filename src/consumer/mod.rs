//! Consumer: a pool of connections subscribed to one topic/channel.
//!
//! Connections come from fixed nsqd addresses or from polling nsqlookupd.
//! Each connection gets a pump task that fans its messages into one
//! rendezvous dispatch [`Channel`], which a fixed pool of worker tasks
//! drains. Workers run the registered [`Handler`], finish or requeue the
//! message, and report the outcome to the flow controller (see [`flow`]),
//! which owns the RDY budget and the backoff state machine.
//!
//! ```text
//! conn A ── pump ─┐
//! conn B ── pump ─┼─► dispatch ─► worker × N ─► Handler
//! conn C ── pump ─┘                   │
//!                                      └─► finish / requeue ─► flow (RDY, backoff)
//! ```

mod flow;
mod in_flight;
mod lookup;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::{BackoffStrategy, ExponentialStrategy};
use crate::chan::{after, Channel, Select, Ticker};
use crate::config::{Config, MAX_IN_FLIGHT_LIMIT};
use crate::conn::{Completions, ConnEvent, Connection};
use crate::error::{NsqError, Result};
use crate::handler::Handler;
use crate::message::Message;
use crate::protocol::{validate_channel_name, validate_topic_name};
use flow::{Action, FlowState, Outcome, Phase};
use in_flight::{InFlightCounter, InFlightGuard};
use lookup::LookupClient;

/// Fraction of a connection's RDY in flight at which it counts as starved.
const STARVED_RATIO: f64 = 0.85;

/// Base delay before redialing a direct nsqd address.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling when backoff is disabled.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Counters reported by [`Consumer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub messages_received: u64,
    /// FIN sent, whether by the handler or the consumer; includes messages
    /// given up on.
    pub messages_finished: u64,
    /// REQ sent, whether by the handler or the consumer.
    pub messages_requeued: u64,
    /// Messages given up on after `max_attempts`.
    pub messages_failed: u64,
    pub connections: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    failed: AtomicU64,
    completions: Arc<Completions>,
}

struct ConnEntry {
    id: u64,
    conn: Connection,
    from_lookupd: bool,
}

struct Inner {
    topic: String,
    channel: String,
    config: Arc<Config>,
    backoff: Arc<dyn BackoffStrategy>,
    max_in_flight: AtomicU32,
    state: AtomicU8,
    started: AtomicBool,
    handlers: Mutex<Vec<(Arc<dyn Handler>, usize)>>,
    conns: Mutex<HashMap<String, ConnEntry>>,
    /// Addresses being dialed.
    pending: Mutex<HashSet<String>>,
    /// Direct addresses to keep connected.
    direct: Mutex<HashSet<String>>,
    lookupds: Mutex<Vec<String>>,
    lookup: LookupClient,
    flow: tokio::sync::Mutex<FlowState>,
    in_flight: InFlightCounter,
    counters: Counters,
    next_conn_id: AtomicU64,
    /// Messages travel with the slot counting them as in flight.
    dispatch: Channel<(Message, InFlightGuard)>,
    /// Wakes the lookupd poller for an immediate query.
    lookup_now: Channel<()>,
    /// Closed when stop begins.
    stop_signal: Channel<()>,
    /// Closed when stop completes.
    stopped: Channel<()>,
    pumps: Mutex<HashMap<u64, JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Consumes messages from one topic/channel over any number of nsqds.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.inner.topic)
            .field("channel", &self.inner.channel)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Consumer {
    /// Create a consumer. Validates the names and the configuration.
    pub fn new(topic: &str, channel: &str, config: Config) -> Result<Self> {
        validate_topic_name(topic)?;
        validate_channel_name(channel)?;
        config.validate()?;

        let lookup = LookupClient::new(config.read_timeout)?;
        let inner = Inner {
            topic: topic.to_string(),
            channel: channel.to_string(),
            backoff: config.backoff(),
            max_in_flight: AtomicU32::new(config.max_in_flight),
            config: Arc::new(config),
            state: AtomicU8::new(RUNNING),
            started: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            conns: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            direct: Mutex::new(HashSet::new()),
            lookupds: Mutex::new(Vec::new()),
            lookup,
            flow: tokio::sync::Mutex::new(FlowState::new()),
            in_flight: InFlightCounter::new(),
            counters: Counters::default(),
            next_conn_id: AtomicU64::new(1),
            dispatch: Channel::new(0),
            lookup_now: Channel::new(1),
            stop_signal: Channel::new(0),
            stopped: Channel::new(0),
            pumps: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Register a handler run by one worker.
    ///
    /// Must be called before the first connect.
    pub fn add_handler<H: Handler>(&self, handler: H) -> Result<()> {
        self.add_concurrent_handlers(handler, 1)
    }

    /// Register a handler run by `concurrency` workers.
    pub fn add_concurrent_handlers<H: Handler>(&self, handler: H, concurrency: usize) -> Result<()> {
        if self.inner.is_stopping() {
            return Err(NsqError::Stopped);
        }
        if self.inner.started.load(Ordering::Acquire) {
            return Err(NsqError::Config(
                "handlers must be added before connecting".to_string(),
            ));
        }
        if concurrency == 0 {
            return Err(NsqError::Config("handler concurrency must be positive".to_string()));
        }
        lock(&self.inner.handlers).push((Arc::new(handler), concurrency));
        Ok(())
    }

    /// Connect to one nsqd. Fails if already connected to `addr`.
    pub async fn connect_to_nsqd(&self, addr: &str) -> Result<()> {
        self.inner.start()?;
        if !lock(&self.inner.direct).insert(addr.to_string()) {
            return Err(NsqError::Config(format!("already connected to {}", addr)));
        }
        let result = Arc::clone(&self.inner).open(addr, false).await;
        if result.is_err() {
            lock(&self.inner.direct).remove(addr);
        }
        result
    }

    /// Connect to several nsqds, stopping at the first failure.
    pub async fn connect_to_nsqds<S: AsRef<str>>(&self, addrs: &[S]) -> Result<()> {
        for addr in addrs {
            self.connect_to_nsqd(addr.as_ref()).await?;
        }
        Ok(())
    }

    /// Add an nsqlookupd (`host:port` or URL) to discover nsqds from.
    ///
    /// The first lookupd starts periodic polling. Adding a lookupd that is
    /// already known does nothing.
    pub async fn connect_to_lookupd(&self, addr: &str) -> Result<()> {
        self.inner.start()?;
        let first = {
            let mut lookupds = lock(&self.inner.lookupds);
            if lookupds.iter().any(|l| l == addr) {
                return Ok(());
            }
            lookupds.push(addr.to_string());
            lookupds.len() == 1
        };
        tracing::info!("added lookupd {} for {}", addr, self.inner.topic);

        if first {
            let task = tokio::spawn(Arc::clone(&self.inner).poll_lookupds());
            lock(&self.inner.tasks).push(task);
        }
        Arc::clone(&self.inner).query_lookupds().await;
        Ok(())
    }

    pub async fn connect_to_lookupds<S: AsRef<str>>(&self, addrs: &[S]) -> Result<()> {
        for addr in addrs {
            self.connect_to_lookupd(addr.as_ref()).await?;
        }
        Ok(())
    }

    /// Close the connection to a directly added nsqd and stop redialing it.
    pub fn disconnect_from_nsqd(&self, addr: &str) -> Result<()> {
        if !lock(&self.inner.direct).remove(addr) {
            return Err(NsqError::Config(format!("not connected to {}", addr)));
        }
        if let Some(entry) = lock(&self.inner.conns).remove(addr) {
            tracing::info!("{}: disconnecting", addr);
            entry.conn.close();
        }
        Ok(())
    }

    /// Change the RDY budget shared by all connections.
    pub async fn set_max_in_flight(&self, max_in_flight: u32) -> Result<()> {
        if max_in_flight > MAX_IN_FLIGHT_LIMIT {
            return Err(NsqError::Config(format!(
                "max_in_flight {} exceeds {}",
                max_in_flight, MAX_IN_FLIGHT_LIMIT
            )));
        }
        self.inner.max_in_flight.store(max_in_flight, Ordering::Release);
        let mut flow = self.inner.flow.lock().await;
        self.inner.apply_rdy(&mut flow).await;
        Ok(())
    }

    /// Stop consuming and wait until shutdown completes.
    ///
    /// Sends CLS on every connection, waits up to `close_wait_timeout` for
    /// in-flight messages, closes the connections and joins every task.
    /// No handler runs after this returns. Calling it again just waits.
    pub async fn stop(&self) {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stopped().await;
            return;
        }
        tracing::info!("stopping consumer {}/{}", self.inner.topic, self.inner.channel);
        self.inner.stop_signal.close();

        let conns = self.inner.connections();
        for conn in &conns {
            if let Err(e) = conn.start_close().await {
                tracing::debug!("{}: CLS not sent: {}", conn.address(), e);
            }
        }
        let timeout = self.inner.config.close_wait_timeout;
        if !self.inner.in_flight.wait_idle(timeout).await {
            tracing::warn!(
                "{} messages still in flight after {:?}",
                self.inner.in_flight.count(),
                timeout
            );
        }
        for conn in &conns {
            conn.close();
        }
        for conn in &conns {
            conn.closed().await;
        }

        // nothing taken from here on can be finished, so stop dispatching
        self.inner.dispatch.close();
        let pumps: Vec<_> = lock(&self.inner.pumps).drain().map(|(_, h)| h).collect();
        join_all("pump", pumps).await;
        let workers: Vec<_> = lock(&self.inner.workers).drain(..).collect();
        join_all("worker", workers).await;
        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        join_all("background", tasks).await;

        self.inner.state.store(STOPPED, Ordering::Release);
        self.inner.stopped.close();
        tracing::info!("consumer {}/{} stopped", self.inner.topic, self.inner.channel);
    }

    /// Wait until [`stop`](Self::stop) has completed.
    pub async fn stopped(&self) {
        let _ = self.inner.stopped.recv().await;
    }

    pub fn stats(&self) -> ConsumerStats {
        let c = &self.inner.counters;
        ConsumerStats {
            messages_received: c.received.load(Ordering::Relaxed),
            messages_finished: c.completions.finished.load(Ordering::Relaxed),
            messages_requeued: c.completions.requeued.load(Ordering::Relaxed),
            messages_failed: c.failed.load(Ordering::Relaxed),
            connections: lock(&self.inner.conns).len(),
            in_flight: self.inner.in_flight.count(),
        }
    }

    /// Last RDY sent on each connection, by address.
    pub fn connection_rdy(&self) -> HashMap<String, u32> {
        lock(&self.inner.conns)
            .iter()
            .map(|(addr, entry)| (addr.clone(), entry.conn.rdy()))
            .collect()
    }

    /// Whether any connection has used most of its RDY credit.
    pub fn is_starved(&self) -> bool {
        lock(&self.inner.conns).values().any(|entry| {
            let rdy = entry.conn.rdy();
            rdy > 0 && entry.conn.in_flight() as f64 >= STARVED_RATIO * f64::from(rdy)
        })
    }
}

impl Inner {
    fn is_stopping(&self) -> bool {
        self.state.load(Ordering::Acquire) != RUNNING
    }

    /// Spawn the workers and the redistribution task on first connect.
    fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_stopping() {
            return Err(NsqError::Stopped);
        }
        let handlers = lock(&self.handlers);
        if handlers.is_empty() {
            return Err(NsqError::NoHandler);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut workers = lock(&self.workers);
        for (handler, concurrency) in handlers.iter() {
            for _ in 0..*concurrency {
                workers.push(tokio::spawn(Arc::clone(self).worker(Arc::clone(handler))));
            }
        }
        lock(&self.tasks).push(tokio::spawn(Arc::clone(self).redistribute_loop()));
        Ok(())
    }

    /// Live connections ordered by address.
    fn connections(&self) -> Vec<Connection> {
        let conns = lock(&self.conns);
        let mut entries: Vec<_> = conns.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, e)| e.conn.clone()).collect()
    }

    /// Dial, subscribe and add a connection to the pool.
    async fn open(self: Arc<Self>, addr: &str, from_lookupd: bool) -> Result<()> {
        {
            let conns = lock(&self.conns);
            let mut pending = lock(&self.pending);
            if conns.contains_key(addr) || !pending.insert(addr.to_string()) {
                return Err(NsqError::Config(format!("already connected to {}", addr)));
            }
        }
        let result = self.dial(addr).await;
        lock(&self.pending).remove(addr);
        let conn = result?;

        if self.is_stopping() {
            conn.close();
            return Err(NsqError::Stopped);
        }

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.conns).insert(
            addr.to_string(),
            ConnEntry {
                id,
                conn: conn.clone(),
                from_lookupd,
            },
        );
        {
            let mut pumps = lock(&self.pumps);
            let pump = tokio::spawn(Arc::clone(&self).pump(id, conn, from_lookupd));
            pumps.insert(id, pump);
        }

        let mut flow = self.flow.lock().await;
        self.apply_rdy(&mut flow).await;
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<Connection> {
        let completions = Arc::clone(&self.counters.completions);
        let conn = Connection::connect_counted(addr, Arc::clone(&self.config), completions).await?;
        if let Err(e) = conn.subscribe(&self.topic, &self.channel).await {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Push the flow controller's RDY targets to every connection.
    async fn apply_rdy(&self, flow: &mut FlowState) {
        let conns = self.connections();
        let addrs: Vec<&str> = conns.iter().map(|c| c.address()).collect();
        let targets = flow.targets(&addrs, self.max_in_flight.load(Ordering::Acquire));

        for increase in [false, true] {
            for (conn, target) in conns.iter().zip(&targets) {
                let current = conn.rdy();
                let wanted = if increase {
                    *target > current
                } else {
                    *target < current
                };
                if wanted {
                    if let Err(e) = conn.set_rdy(*target).await {
                        tracing::debug!("{}: RDY {} not sent: {}", conn.address(), target, e);
                    }
                }
            }
        }
    }

    /// Fan one connection's messages into the dispatch channel.
    async fn pump(self: Arc<Self>, id: u64, conn: Connection, from_lookupd: bool) {
        enum Input {
            Message(Option<Message>),
            Event(Option<ConnEvent>),
        }

        let mut messages = Some(conn.messages());
        let mut events = Some(conn.events());
        while messages.is_some() || events.is_some() {
            let input = Select::new()
                .recv(messages, Input::Message)
                .recv(events, Input::Event)
                .run()
                .await;
            match input {
                Input::Message(Some(msg)) => self.dispatch_message(&conn, msg).await,
                Input::Message(None) => messages = None,
                Input::Event(Some(ConnEvent::CloseWait)) => {
                    tracing::debug!("{}: server is draining", conn.address())
                }
                Input::Event(Some(_)) => {}
                Input::Event(None) => events = None,
            }
        }

        self.connection_closed(id, &conn, from_lookupd).await;
        lock(&self.pumps).remove(&id);
    }

    async fn dispatch_message(&self, conn: &Connection, msg: Message) {
        if conn.is_closing() {
            tracing::debug!("{}: dropping message {} from closing connection", conn.address(), msg.id());
            return;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let guard = self.in_flight.acquire();
        self.top_up(conn).await;

        if self.dispatch.send((msg, guard)).await.is_err() {
            tracing::debug!("{}: dispatch closed", conn.address());
        }
    }

    /// Resend RDY when most of the last grant has been used.
    async fn top_up(&self, conn: &Connection) {
        let rdy = conn.rdy();
        let remaining = conn.rdy_remaining();
        if rdy == 0 || !(remaining <= 1 || remaining < rdy / 4) {
            return;
        }
        let flow = self.flow.lock().await;
        if flow.phase() == Phase::Normal && conn.rdy() == rdy {
            if let Err(e) = conn.set_rdy(rdy).await {
                tracing::debug!("{}: RDY top-up failed: {}", conn.address(), e);
            }
        }
    }

    async fn connection_closed(self: &Arc<Self>, id: u64, conn: &Connection, from_lookupd: bool) {
        let addr = conn.address().to_string();
        let removed = {
            let mut conns = lock(&self.conns);
            match conns.get(&addr) {
                Some(entry) if entry.id == id => conns.remove(&addr).is_some(),
                _ => false,
            }
        };
        if self.is_stopping() {
            return;
        }
        tracing::info!("{}: connection lost", addr);
        {
            let mut flow = self.flow.lock().await;
            self.apply_rdy(&mut flow).await;
        }
        if !removed {
            return;
        }
        if from_lookupd {
            let _ = self.lookup_now.try_send(());
        } else if lock(&self.direct).contains(&addr) {
            let task = tokio::spawn(Arc::clone(self).reconnect(addr));
            let mut tasks = lock(&self.tasks);
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    fn reconnect(self: Arc<Self>, addr: String) -> impl std::future::Future<Output = ()> + Send {
        async move {
            let ceiling = if self.config.max_backoff_duration.is_zero() {
                RECONNECT_MAX_DELAY
            } else {
                self.config.max_backoff_duration
            };
            let strategy = ExponentialStrategy::new(RECONNECT_BASE_DELAY, ceiling);
            let mut attempt = 1;
            loop {
                let delay = strategy.calculate(attempt);
                let timer = after(delay);
                let proceed = Select::new()
                    .recv(&timer, |_| true)
                    .recv(&self.stop_signal, |_| false)
                    .run()
                    .await;
                if !proceed || self.is_stopping() || !lock(&self.direct).contains(&addr) {
                    return;
                }
                match Arc::clone(&self).open(&addr, false).await {
                    Ok(()) => {
                        tracing::info!("{}: reconnected", addr);
                        return;
                    }
                    Err(NsqError::Config(_)) | Err(NsqError::Stopped) => return,
                    Err(e) => {
                        tracing::warn!("{}: reconnect attempt {} failed: {}", addr, attempt, e);
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }
    }

    async fn poll_lookupds(self: Arc<Self>) {
        let interval = self.config.lookupd_poll_interval;
        let jitter = interval.mul_f64(self.config.lookupd_poll_jitter * rand::random::<f64>());
        let timer = after(jitter);
        let go = Select::new()
            .recv(&timer, |_| true)
            .recv(&self.stop_signal, |_| false)
            .run()
            .await;
        if !go {
            return;
        }

        let ticker = Ticker::new(interval);
        loop {
            let go = Select::new()
                .recv(ticker.chan(), |t| t.is_some())
                .recv(&self.lookup_now, |v| v.is_some())
                .recv(&self.stop_signal, |_| false)
                .run()
                .await;
            if !go || self.is_stopping() {
                return;
            }
            Arc::clone(&self).query_lookupds().await;
        }
    }

    /// Query every lookupd and reconcile lookupd-sourced connections.
    async fn query_lookupds(self: Arc<Self>) {
        let lookupds = lock(&self.lookupds).clone();
        let mut found = BTreeSet::new();
        let mut complete = true;
        for lookupd in &lookupds {
            match self.lookup.query(lookupd, &self.topic).await {
                Ok(addrs) => found.extend(addrs),
                Err(e) => {
                    tracing::warn!("{}: lookup of {} failed: {}", lookupd, self.topic, e);
                    complete = false;
                }
            }
        }

        for addr in &found {
            if self.is_stopping() {
                return;
            }
            let known = lock(&self.conns).contains_key(addr) || lock(&self.pending).contains(addr);
            if known {
                continue;
            }
            match Arc::clone(&self).open(addr, true).await {
                Ok(()) => tracing::info!("{}: connected via lookupd", addr),
                Err(e) => tracing::warn!("{}: connect failed: {}", addr, e),
            }
        }

        if complete {
            let stale: Vec<Connection> = {
                let mut conns = lock(&self.conns);
                let gone: Vec<String> = conns
                    .iter()
                    .filter(|(addr, e)| e.from_lookupd && !found.contains(*addr))
                    .map(|(addr, _)| addr.clone())
                    .collect();
                gone.iter()
                    .filter_map(|addr| conns.remove(addr))
                    .map(|e| e.conn)
                    .collect()
            };
            for conn in stale {
                tracing::info!("{}: no longer listed by lookupd, closing", conn.address());
                conn.close();
            }
        }
    }

    async fn redistribute_loop(self: Arc<Self>) {
        let ticker = Ticker::new(self.config.rdy_redistribute_interval);
        loop {
            let tick = Select::new()
                .recv(ticker.chan(), |t| t.is_some())
                .recv(&self.stop_signal, |_| false)
                .run()
                .await;
            if !tick {
                return;
            }

            let mut flow = self.flow.lock().await;
            let conns = self.connections();
            let now = Instant::now();
            let idle: Vec<(&str, bool)> = conns
                .iter()
                .map(|c| {
                    let idle = now.duration_since(c.last_activity()) > self.config.low_rdy_idle_timeout;
                    (c.address(), idle)
                })
                .collect();
            if flow.redistribute(&idle, self.max_in_flight.load(Ordering::Acquire)) {
                tracing::debug!("moving RDY credit away from idle connections");
                self.apply_rdy(&mut flow).await;
            }
        }
    }

    async fn worker(self: Arc<Self>, handler: Arc<dyn Handler>) {
        while let Some((msg, guard)) = self.dispatch.recv().await {
            self.process(&handler, msg).await;
            guard.release();
        }
    }

    async fn process(self: &Arc<Self>, handler: &Arc<dyn Handler>, msg: Message) {
        let max_attempts = self.config.max_attempts;
        if max_attempts > 0 && msg.attempts() > max_attempts {
            handler.log_failed_message(&msg);
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = msg.finish().await {
                tracing::warn!("{}: finishing failed message {}: {}", msg.address(), msg.id(), e);
            }
            return;
        }

        let task = {
            let handler = Arc::clone(handler);
            let msg = msg.clone();
            tokio::spawn(async move { handler.handle(msg).await })
        };
        let outcome = match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("handler panicked: {}", e)),
        };

        let signal = match outcome {
            Ok(()) => {
                if !msg.has_responded() {
                    if let Err(e) = msg.finish().await {
                        tracing::warn!("{}: finish {} failed: {}", msg.address(), msg.id(), e);
                    }
                }
                Outcome::Success
            }
            Err(e) => {
                tracing::warn!("{}: handler failed for message {}: {}", msg.address(), msg.id(), e);
                if !msg.has_responded() {
                    if let Err(e) = msg.requeue(None).await {
                        tracing::warn!("{}: requeue {} failed: {}", msg.address(), msg.id(), e);
                    }
                }
                Outcome::Failure
            }
        };

        if !msg.is_backoff_neutral() {
            self.report(signal).await;
        }
    }

    async fn report(self: &Arc<Self>, outcome: Outcome) {
        let mut flow = self.flow.lock().await;
        let action = flow.record(outcome, self.backoff.as_ref(), self.config.max_backoff_duration);
        match action {
            Action::None => {}
            Action::Redistribute => {
                tracing::info!("backoff complete, resuming");
                self.apply_rdy(&mut flow).await;
            }
            Action::Backoff { delay, generation } => {
                tracing::warn!("backing off for {:?} ({} failures)", delay, flow.failures());
                self.apply_rdy(&mut flow).await;
                drop(flow);
                let task = tokio::spawn(Arc::clone(self).backoff_timer(delay, generation));
                let mut tasks = lock(&self.tasks);
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
        }
    }

    async fn backoff_timer(self: Arc<Self>, delay: Duration, generation: u64) {
        let timer = after(delay);
        let elapsed = Select::new()
            .recv(&timer, |_| true)
            .recv(&self.stop_signal, |_| false)
            .run()
            .await;
        if !elapsed {
            return;
        }
        let mut flow = self.flow.lock().await;
        if flow.backoff_elapsed(generation) {
            tracing::info!("backoff timer elapsed, probing with RDY 1");
            self.apply_rdy(&mut flow).await;
        }
    }
}

async fn join_all(kind: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                tracing::error!("{} task failed: {}", kind, e);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn consumer() -> Consumer {
        Consumer::new("orders", "billing", Config::default()).unwrap()
    }

    #[test]
    fn test_new_validates_names() {
        assert!(matches!(
            Consumer::new("bad topic", "billing", Config::default()),
            Err(NsqError::InvalidName(_))
        ));
        assert!(matches!(
            Consumer::new("orders", "", Config::default()),
            Err(NsqError::InvalidName(_))
        ));
        assert!(Consumer::new("orders", "billing#ephemeral", Config::default()).is_ok());
    }

    #[test]
    fn test_new_validates_config() {
        let config = Config {
            min_requeue_delay: Duration::from_secs(10),
            max_requeue_delay: Duration::from_secs(1),
            ..Config::default()
        };
        assert!(matches!(
            Consumer::new("orders", "billing", config),
            Err(NsqError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_rules() {
        let consumer = consumer();
        assert!(matches!(
            consumer.connect_to_nsqd("127.0.0.1:1").await,
            Err(NsqError::NoHandler)
        ));
        assert!(consumer
            .add_concurrent_handlers(handler_fn(|_msg| async { Ok(()) }), 0)
            .is_err());
        consumer
            .add_concurrent_handlers(handler_fn(|_msg| async { Ok(()) }), 3)
            .unwrap();
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_set_max_in_flight_bounds() {
        let consumer = consumer();
        assert!(consumer.set_max_in_flight(MAX_IN_FLIGHT_LIMIT + 1).await.is_err());
        consumer.set_max_in_flight(10).await.unwrap();
        assert_eq!(consumer.inner.max_in_flight.load(Ordering::Acquire), 10);
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_no_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let consumer = consumer();
        consumer.add_handler(handler_fn(|_msg| async { Ok(()) })).unwrap();
        assert!(consumer.connect_to_nsqd(&addr).await.is_err());
        assert!(lock(&consumer.inner.direct).is_empty());
        assert!(lock(&consumer.inner.pending).is_empty());
        assert_eq!(consumer.stats(), ConsumerStats::default());
        assert!(!consumer.is_starved());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_before_connect() {
        let consumer = consumer();
        consumer.stop().await;
        consumer.stop().await;
        assert!(matches!(
            consumer.add_handler(handler_fn(|_msg| async { Ok(()) })),
            Err(NsqError::Stopped)
        ));
        assert!(matches!(
            consumer.connect_to_lookupd("127.0.0.1:4161").await,
            Err(NsqError::Stopped)
        ));
    }
}
