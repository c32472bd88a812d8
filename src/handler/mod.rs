//! Message handlers.
//!
//! A [`Handler`] processes one [`Message`] at a time. The consumer finishes
//! the message when the handler returns `Ok(())` and requeues it when the
//! handler fails, unless the handler already responded itself.
//!
//! # Example
//!
//! ```ignore
//! use nsq_client::{handler_fn, Consumer, Config};
//!
//! let consumer = Consumer::new("orders", "billing", Config::default())?;
//! consumer.add_handler(handler_fn(|msg| async move {
//!     println!("{} bytes", msg.body().len());
//!     Ok(())
//! }))?;
//! ```

use std::future::Future;
use std::pin::Pin;

use crate::message::Message;

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for handler functions.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Processes delivered messages.
pub trait Handler: Send + Sync + 'static {
    /// Handle one message.
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult>;

    /// Called when a message is given up on after too many attempts.
    ///
    /// The message is finished right after this returns.
    fn log_failed_message(&self, message: &Message) {
        tracing::warn!(
            "giving up on message {} after {} attempts",
            message.id(),
            message.attempts()
        );
    }
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(message))
    }
}
