//! Per-(site, purpose) minimum interval gate.
//!
//! Every request goes through [`RateLimiter::await_slot`], which suspends the caller until the
//! configured interval has passed since the previous request of the same site and purpose.
//! The check and the timestamp update happen under the same lock, so two callers can never
//! both observe a stale timestamp and fire inside one interval window.
//!
//! Time comes from `tokio::time`, which lets tests drive the limiter with a paused clock.
use std::time::Duration;

use ahash::AHashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use tokio::time::{sleep, Instant};

use crate::sites::{Purpose, RateIntervals};

#[derive(Debug, Default)]
pub struct RateLimiter {
    last_request: Mutex<AHashMap<(String, Purpose), Instant>>,
    intervals: RwLock<AHashMap<String, RateIntervals>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or replaces the intervals of a site.
    pub fn register(&self, site: &str, intervals: RateIntervals) {
        self.intervals.write().insert(site.to_string(), intervals);
    }

    pub fn interval(&self, site: &str, purpose: Purpose) -> Duration {
        self.intervals
            .read()
            .get(site)
            .map(|i| i.get(purpose))
            .unwrap_or_default()
    }

    /// Waits until a request of `purpose` may be sent to `site`, then claims the slot.
    pub async fn await_slot(&self, site: &str, purpose: Purpose) {
        let interval = self.interval(site, purpose);
        let key = (site.to_string(), purpose);

        loop {
            let wait = {
                let mut last = self.last_request.lock();
                let now = Instant::now();
                match last.get(&key).copied() {
                    Some(prev) if now < prev + interval => prev + interval - now,
                    _ => {
                        last.insert(key, now);
                        return;
                    }
                }
            };
            debug!("Throttling {} request to {} for {:?}", purpose, site, wait);
            // Another caller may grab the slot meanwhile, so check again after waking up
            sleep(wait).await;
        }
    }

    /// Marks a failed request so the next `Error` slot for the site waits a full interval.
    pub fn penalize(&self, site: &str) {
        self.last_request
            .lock()
            .insert((site.to_string(), Purpose::Error), Instant::now());
    }

    /// Waits out the error backoff of `site`.
    pub async fn backoff(&self, site: &str) {
        self.penalize(site);
        self.await_slot(site, Purpose::Error).await;
    }
}
