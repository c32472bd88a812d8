//! Channel and select primitives.
//!
//! - [`Channel`]: buffered or rendezvous FIFO with close-and-drain
//! - [`Select`]: wait for exactly one of several send/receive cases
//! - [`after`] / [`Ticker`]: timers delivered through channels
//!
//! Connections, the consumer's dispatch path and its backoff timer are all
//! wired together with these.

mod channel;
mod select;
mod timer;

pub use channel::{
    Channel, Iter, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError, TrySendError,
};
pub use select::Select;
pub use timer::{after, Ticker};
