use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Scheduling primitive shared by the cell loop and the detail fetcher.
/// `acquire` enforces a minimum interval between consecutive external
/// requests; `back_off` is the single deliberate pause taken after a
/// rate-limit or timeout signal.
pub struct Pacer {
    interval: Duration,
    backoff: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration, backoff: Duration) -> Self {
        Self {
            interval,
            backoff,
            last_tick: AsyncMutex::new(None),
        }
    }

    /// Waits until at least the configured interval has elapsed since the
    /// previous acquisition, then claims the current tick.
    pub async fn acquire(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }

    /// One pause after a throttling signal. The tick is reset so the next
    /// acquisition does not wait again on top of the backoff.
    pub async fn back_off(&self) {
        debug!(backoff = ?self.backoff, "pausing after throttling signal");
        sleep(self.backoff).await;
        let mut guard = self.last_tick.lock().await;
        *guard = Some(Instant::now());
    }

    pub fn backoff_duration(&self) -> Duration {
        self.backoff
    }
}
