//! Count of messages handed to the consumer but not yet completed.
//!
//! A message is counted from the moment its connection's pump takes it
//! until a worker has finished or requeued it. [`InFlightGuard`] releases
//! the count on drop, so a worker task that is cancelled mid-handler still
//! gives its slot back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Interval between checks while waiting for the count to drain.
const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Shared in-flight counter.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlightCounter {
    count: Arc<AtomicUsize>,
}

impl InFlightCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Count one message until the returned guard is dropped.
    pub(crate) fn acquire(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            counter: self.clone(),
            released: false,
        }
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until nothing is in flight.
    ///
    /// Returns `false` if `timeout` passed first.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.count() == 0 {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    fn release(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Releases one in-flight slot on drop.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    counter: InFlightCounter,
    released: bool,
}

impl InFlightGuard {
    /// Release the slot now.
    pub(crate) fn release(mut self) {
        if !self.released {
            self.counter.release();
            self.released = true;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.released {
            self.counter.release();
        }
    }
}
