//! # nsq-client
//!
//! Async client for the NSQ V2 TCP protocol.
//!
//! - [`Producer`] publishes to one nsqd and waits for each acknowledgement.
//! - [`Consumer`] subscribes to a topic/channel over any number of nsqds
//!   (given directly or discovered through nsqlookupd), spreads the
//!   `max_in_flight` budget across them as RDY credit, and backs off when
//!   handlers fail.
//! - [`Connection`] is the per-nsqd protocol engine both are built on.
//! - [`chan`] holds the channel and select primitives the engine uses for
//!   every hand-off between tasks.
//!
//! ## Example
//!
//! ```ignore
//! use nsq_client::{handler_fn, Config, Consumer, Producer};
//!
//! #[tokio::main]
//! async fn main() -> nsq_client::Result<()> {
//!     let producer = Producer::new("127.0.0.1:4150", Config::default())?;
//!     producer.publish("orders", "Hello!").await?;
//!
//!     let consumer = Consumer::new("orders", "billing", Config::default())?;
//!     consumer.add_handler(handler_fn(|msg| async move {
//!         println!("{:?}", msg.body());
//!         Ok(())
//!     }))?;
//!     consumer.connect_to_lookupd("127.0.0.1:4161").await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     consumer.stop().await;
//!     producer.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod chan;
pub mod config;
pub mod conn;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod producer;
pub mod protocol;

pub use chan::{Channel, Select};
pub use config::Config;
pub use conn::{ConnEvent, ConnState, Connection};
pub use consumer::{Consumer, ConsumerStats};
pub use error::{NsqError, Result};
pub use handler::{handler_fn, Handler, HandlerError, HandlerResult};
pub use message::{Message, MessageId};
pub use producer::Producer;
