//! Process-wide send rate limiter
//!
//! Every dispatch task of a worker shares one limiter. Callers reserve
//! consecutive slots spaced by a fixed interval, so the aggregate send rate
//! stays bounded however many jobs are in flight.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fixed-interval limiter handing out send slots in reservation order
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `messages_per_second` sends per second; 0 is treated as 1
    #[must_use]
    pub fn per_second(messages_per_second: u32) -> Self {
        let rate = f64::from(messages_per_second.max(1));
        Self::with_interval(Duration::from_secs_f64(1.0 / rate))
    }

    /// Limiter with an explicit spacing between sends
    #[must_use]
    pub const fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::const_new(None),
        }
    }

    /// Spacing between consecutive slots
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next free slot
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
