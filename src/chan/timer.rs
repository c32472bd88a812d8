//! Timers exposed as channels so they can take part in a [`Select`](super::Select).

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::channel::{Channel, TrySendError};

/// Channel that yields one `Instant` after `duration` and then closes.
///
/// Must be called from within a tokio runtime.
pub fn after(duration: Duration) -> Channel<Instant> {
    let chan = Channel::new(1);
    let tx = chan.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = tx.try_send(Instant::now());
        tx.close();
    });
    chan
}

/// Periodic ticks delivered through a one-slot channel.
///
/// A tick that finds the slot full is dropped. The background task stops
/// when the ticker is dropped or [`stop`](Ticker::stop)ped.
#[derive(Debug)]
pub struct Ticker {
    chan: Channel<Instant>,
    task: JoinHandle<()>,
}

impl Ticker {
    /// Start ticking every `period`; the first tick arrives after one period.
    pub fn new(period: Duration) -> Self {
        let chan = Channel::new(1);
        let tx = chan.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let at = interval.tick().await;
                if let Err(TrySendError::Closed(_)) = tx.try_send(at) {
                    break;
                }
            }
        });
        Self { chan, task }
    }

    /// The tick channel.
    pub fn chan(&self) -> &Channel<Instant> {
        &self.chan
    }

    /// Stop ticking and close the channel.
    pub fn stop(&self) {
        self.task.abort();
        self.chan.close();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
