//! Blocking channel.
//!
//! A [`Channel`] is a cloneable handle to a FIFO queue shared by any number
//! of senders and receivers. Capacity 0 gives rendezvous behaviour: a send
//! only completes once a receiver is parked on the channel. Waiting is done
//! by suspending the calling task, never by parking a thread.
//!
//! Every state change (item queued, item taken, receiver parked, close)
//! wakes all registered watchers, which lets [`Select`](super::Select) wait
//! on several channels with one [`Notify`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::NsqError;

/// Error returned by [`Channel::send`] when the channel is closed.
///
/// The unsent value is handed back.
#[derive(Error, PartialEq, Eq)]
#[error("send on closed channel")]
pub struct SendError<T>(pub T);

/// Error returned by [`Channel::try_send`].
#[derive(Error, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No buffer slot and no parked receiver.
    #[error("channel full")]
    Full(T),
    /// The channel is closed.
    #[error("send on closed channel")]
    Closed(T),
}

/// Error returned by [`Channel::send_timeout`].
#[derive(Error, PartialEq, Eq)]
pub enum SendTimeoutError<T> {
    /// The deadline passed before the value could be queued.
    #[error("send timed out")]
    Timeout(T),
    /// The channel is closed.
    #[error("send on closed channel")]
    Closed(T),
}

/// Error returned by [`Channel::try_recv`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing queued right now.
    #[error("channel empty")]
    Empty,
    /// The channel is closed and drained.
    #[error("channel closed")]
    Closed,
}

/// Error returned by [`Channel::recv_timeout`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// The deadline passed with nothing to receive.
    #[error("receive timed out")]
    Timeout,
    /// The channel is closed and drained.
    #[error("channel closed")]
    Closed,
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Debug for SendTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendTimeoutError::Timeout(_) => f.write_str("Timeout(..)"),
            SendTimeoutError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> TrySendError<T> {
    /// Recover the value that was not sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

impl<T> From<SendError<T>> for NsqError {
    fn from(_: SendError<T>) -> Self {
        NsqError::ChannelClosed
    }
}

impl<T> From<SendTimeoutError<T>> for NsqError {
    fn from(e: SendTimeoutError<T>) -> Self {
        match e {
            SendTimeoutError::Timeout(_) => NsqError::Timeout("channel send".to_string()),
            SendTimeoutError::Closed(_) => NsqError::ChannelClosed,
        }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    /// `None` means unbounded.
    capacity: Option<usize>,
    closed: bool,
    /// Receivers currently suspended on this channel (plain `recv` or a
    /// parked `Select` with a receive case on it).
    recv_waiting: usize,
    watchers: Vec<Arc<Notify>>,
}

impl<T> State<T> {
    fn can_send(&self) -> bool {
        match self.capacity {
            None => true,
            Some(cap) => self.queue.len() < cap + self.recv_waiting,
        }
    }

    fn wake_all(&self) {
        for watcher in &self.watchers {
            watcher.notify_one();
        }
    }

    fn remove_watcher(&mut self, notify: &Arc<Notify>) {
        if let Some(pos) = self.watchers.iter().position(|w| Arc::ptr_eq(w, notify)) {
            self.watchers.swap_remove(pos);
        }
    }
}

/// A FIFO channel with optional capacity, shared by cloning.
pub struct Channel<T> {
    shared: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Channel")
            .field("len", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Unregisters a suspended sender/receiver even if its future is dropped.
struct Parked<'a, T> {
    chan: &'a Channel<T>,
    notify: Arc<Notify>,
    receiving: bool,
}

impl<T> Drop for Parked<'_, T> {
    fn drop(&mut self) {
        self.chan.unwatch(&self.notify, self.receiving);
    }
}

impl<T> Channel<T> {
    /// Create a channel buffering up to `capacity` items (0 = rendezvous).
    pub fn new(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    /// Create a channel whose sends never wait.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                capacity,
                closed: false,
                recv_waiting: 0,
                watchers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `value`, waiting for a buffer slot or a parked receiver.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        match self.send_until(value, None).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(v)) | Err(SendTimeoutError::Timeout(v)) => {
                Err(SendError(v))
            }
        }
    }

    /// Like [`send`](Self::send) but gives up after `timeout`.
    pub async fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.send_until(value, Some(Instant::now() + timeout)).await
    }

    async fn send_until(&self, value: T, deadline: Option<Instant>) -> Result<(), SendTimeoutError<T>> {
        let mut value = match self.try_send(value) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(v)) => return Err(SendTimeoutError::Closed(v)),
            Err(TrySendError::Full(v)) => v,
        };

        let parked = self.park(false);
        loop {
            let notified = parked.notify.notified();
            value = match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(v)) => return Err(SendTimeoutError::Closed(v)),
                Err(TrySendError::Full(v)) => v,
            };
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return match self.try_send(value) {
                            Ok(()) => Ok(()),
                            Err(TrySendError::Closed(v)) => Err(SendTimeoutError::Closed(v)),
                            Err(TrySendError::Full(v)) => Err(SendTimeoutError::Timeout(v)),
                        };
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Queue `value` only if that is possible without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if !state.can_send() {
            return Err(TrySendError::Full(value));
        }
        state.queue.push_back(value);
        state.wake_all();
        Ok(())
    }

    /// Receive the next item, waiting until one is queued.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.recv_until(None).await.ok()
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_until(Some(Instant::now() + timeout)).await
    }

    async fn recv_until(&self, deadline: Option<Instant>) -> Result<T, RecvTimeoutError> {
        match self.try_recv() {
            Ok(v) => return Ok(v),
            Err(TryRecvError::Closed) => return Err(RecvTimeoutError::Closed),
            Err(TryRecvError::Empty) => {}
        }

        let parked = self.park(true);
        loop {
            let notified = parked.notify.notified();
            match self.try_recv() {
                Ok(v) => return Ok(v),
                Err(TryRecvError::Closed) => return Err(RecvTimeoutError::Closed),
                Err(TryRecvError::Empty) => {}
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_recv().map_err(|e| match e {
                            TryRecvError::Empty => RecvTimeoutError::Timeout,
                            TryRecvError::Closed => RecvTimeoutError::Closed,
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Take the next item if one is queued.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut state = self.lock();
        match state.queue.pop_front() {
            Some(v) => {
                state.wake_all();
                Ok(v)
            }
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Close the channel.
    ///
    /// Further sends fail; queued items stay receivable. Returns `true` only
    /// for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.wake_all();
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Buffer capacity (`None` if unbounded).
    pub fn capacity(&self) -> Option<usize> {
        self.lock().capacity
    }

    /// Draining iterator; ends once the channel is closed and empty.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: self }
    }

    fn park(&self, receiving: bool) -> Parked<'_, T> {
        let notify = Arc::new(Notify::new());
        self.watch(&notify, receiving);
        Parked {
            chan: self,
            notify,
            receiving,
        }
    }

    /// Register `notify` to be woken on every state change.
    ///
    /// A receiving watcher also opens one rendezvous slot for senders.
    pub(crate) fn watch(&self, notify: &Arc<Notify>, receiving: bool) {
        let mut state = self.lock();
        state.watchers.push(Arc::clone(notify));
        if receiving {
            state.recv_waiting += 1;
            state.wake_all();
        }
    }

    pub(crate) fn unwatch(&self, notify: &Arc<Notify>, receiving: bool) {
        let mut state = self.lock();
        state.remove_watcher(notify);
        if receiving {
            state.recv_waiting = state.recv_waiting.saturating_sub(1);
        }
    }
}

/// Async iterator over a [`Channel`], created by [`Channel::iter`].
pub struct Iter<'a, T> {
    chan: &'a Channel<T>,
}

impl<T> Iter<'_, T> {
    /// Next item, or `None` once the channel is closed and drained.
    pub async fn next(&mut self) -> Option<T> {
        self.chan.recv().await
    }
}
