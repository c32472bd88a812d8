//! Multi-way select over [`Channel`]s.
//!
//! ```ignore
//! use nsq_client::chan::{Channel, Select};
//!
//! let outcome = Select::new()
//!     .recv(&messages, |msg| format!("got {:?}", msg))
//!     .recv(&exit, |_| "exit".to_string())
//!     .run()
//!     .await;
//! ```
//!
//! Each attempt scans the cases in a fresh random order and fires the first
//! one that is ready, so among simultaneously ready cases every one is
//! equally likely. With nothing ready, the default case fires if present;
//! otherwise the select registers one [`Notify`] on every channel and
//! rescans whenever any of them changes.
//!
//! A receive case on a closed channel is always ready and yields `None`.
//! A `None` channel is never ready. A select that both sends and receives
//! on the same rendezvous channel counts as its own receiver for the send.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::Notify;

use super::channel::{Channel, SendError, TryRecvError, TrySendError};

trait Case<R> {
    /// Attempt the operation; on success run the callback and return its result.
    fn try_fire(&mut self) -> Option<R>;

    fn watch(&self, notify: &Arc<Notify>);

    fn unwatch(&self, notify: &Arc<Notify>);

    fn is_null(&self) -> bool;
}

struct RecvCase<'a, T, F> {
    chan: Option<&'a Channel<T>>,
    callback: Option<F>,
}

impl<T, R, F> Case<R> for RecvCase<'_, T, F>
where
    F: FnOnce(Option<T>) -> R,
{
    fn try_fire(&mut self) -> Option<R> {
        let chan = self.chan?;
        let value = match chan.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Closed) => None,
            Err(TryRecvError::Empty) => return None,
        };
        self.callback.take().map(|cb| cb(value))
    }

    fn watch(&self, notify: &Arc<Notify>) {
        if let Some(chan) = self.chan {
            chan.watch(notify, true);
        }
    }

    fn unwatch(&self, notify: &Arc<Notify>) {
        if let Some(chan) = self.chan {
            chan.unwatch(notify, true);
        }
    }

    fn is_null(&self) -> bool {
        self.chan.is_none()
    }
}

struct SendCase<'a, T, F> {
    chan: Option<&'a Channel<T>>,
    value: Option<T>,
    callback: Option<F>,
}

impl<T, R, F> Case<R> for SendCase<'_, T, F>
where
    F: FnOnce(Result<(), SendError<T>>) -> R,
{
    fn try_fire(&mut self) -> Option<R> {
        let chan = self.chan?;
        let value = self.value.take()?;
        let outcome = match chan.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(v)) => Err(SendError(v)),
            Err(TrySendError::Full(v)) => {
                self.value = Some(v);
                return None;
            }
        };
        self.callback.take().map(|cb| cb(outcome))
    }

    fn watch(&self, notify: &Arc<Notify>) {
        if let Some(chan) = self.chan {
            chan.watch(notify, false);
        }
    }

    fn unwatch(&self, notify: &Arc<Notify>) {
        if let Some(chan) = self.chan {
            chan.unwatch(notify, false);
        }
    }

    fn is_null(&self) -> bool {
        self.chan.is_none()
    }
}

/// Builder that waits for exactly one of several channel operations.
pub struct Select<'a, R> {
    cases: Vec<Box<dyn Case<R> + Send + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + Send + 'a>>,
    registered: Option<Arc<Notify>>,
}

impl<R> Default for Select<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R> Select<'a, R> {
    /// Empty select. Running it with no cases and no default never completes.
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
            registered: None,
        }
    }

    /// Add a receive case. The callback gets `None` if the channel is closed.
    pub fn recv<T, F>(mut self, chan: impl Into<Option<&'a Channel<T>>>, callback: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Option<T>) -> R + Send + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            chan: chan.into(),
            callback: Some(callback),
        }));
        self
    }

    /// Add a send case. The callback gets the value back if the channel is closed.
    pub fn send<T, F>(mut self, chan: impl Into<Option<&'a Channel<T>>>, value: T, callback: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Result<(), SendError<T>>) -> R + Send + 'a,
    {
        self.cases.push(Box::new(SendCase {
            chan: chan.into(),
            value: Some(value),
            callback: Some(callback),
        }));
        self
    }

    /// Set the action taken when no case is ready. Replaces any earlier default.
    pub fn default<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> R + Send + 'a,
    {
        self.default = Some(Box::new(callback));
        self
    }

    /// Wait for one case (or the default) and return its callback's result.
    pub async fn run(mut self) -> R {
        if let Some(result) = self.scan() {
            return result;
        }
        if let Some(default) = self.default.take() {
            return default();
        }
        if self.cases.iter().all(|c| c.is_null()) {
            return std::future::pending().await;
        }

        let notify = Arc::new(Notify::new());
        for case in &self.cases {
            case.watch(&notify);
        }
        self.registered = Some(Arc::clone(&notify));

        loop {
            let notified = notify.notified();
            if let Some(result) = self.scan() {
                return result;
            }
            notified.await;
        }
    }

    fn scan(&mut self) -> Option<R> {
        let mut order: Vec<usize> = (0..self.cases.len()).collect();
        order.shuffle(&mut rand::rng());
        order.into_iter().find_map(|i| self.cases[i].try_fire())
    }
}

impl<R> Drop for Select<'_, R> {
    fn drop(&mut self) {
        if let Some(notify) = self.registered.take() {
            for case in &self.cases {
                case.unwatch(&notify);
            }
        }
    }
}
