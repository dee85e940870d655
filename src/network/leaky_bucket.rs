//! Leaky bucket pacing
//!
//! Models how much audio the receivers hold but have not played yet. Every
//! admitted frame adds its duration, playback drains the bucket at a fixed
//! rate, and a full bucket makes the caller wait instead of racing ahead of
//! the receivers.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::RateLimitError;

/// Slack for float error in the lazy decay
const EPSILON: f64 = 1e-9;

/// Result of a non-blocking admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The amount was added to the bucket
    Admitted,
    /// Nothing changed; retry after this long
    RetryAfter(Duration),
}

#[derive(Debug)]
struct BucketState {
    last_value: f64,
    last_timestamp: Instant,
}

/// Leaky bucket with lazy decay: there is no background timer, the level is
/// recomputed from the last committed value whenever it is read.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    drain_per_second: u64,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    /// `drain_per_second` must be positive.
    pub fn new(capacity: u64, drain_per_second: u64) -> Self {
        debug_assert!(drain_per_second > 0);
        Self {
            capacity,
            drain_per_second: drain_per_second.max(1),
            state: Mutex::new(BucketState {
                last_value: 0.0,
                last_timestamp: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn drain_per_second(&self) -> u64 {
        self.drain_per_second
    }

    /// Current level, between zero and the capacity
    pub fn current_value(&self) -> f64 {
        let state = self.state.lock();
        self.decayed(&state, Instant::now())
    }

    fn decayed(&self, state: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_timestamp).as_secs_f64();
        (state.last_value - self.drain_per_second as f64 * elapsed).max(0.0)
    }

    /// Admit `amount` if it fits right now.
    ///
    /// When it does not fit the state is left untouched and the time until it
    /// would fit is returned. Check and commit happen under one lock.
    pub fn try_put(&self, amount: u64) -> Result<Admission, RateLimitError> {
        if amount > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                amount,
                capacity: self.capacity,
            });
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let value = self.decayed(&state, now);
        let excess = value + amount as f64 - self.capacity as f64;

        if excess > EPSILON {
            let nanos = (excess * 1e9 / self.drain_per_second as f64).ceil() as u64;
            return Ok(Admission::RetryAfter(Duration::from_nanos(nanos.max(1))));
        }

        state.last_value = (value + amount as f64).min(self.capacity as f64);
        state.last_timestamp = now;
        Ok(Admission::Admitted)
    }

    /// Wait until `amount` is admitted. Only the calling task sleeps.
    pub async fn wait_for_capacity(&self, amount: u64) -> Result<(), RateLimitError> {
        loop {
            match self.try_put(amount)? {
                Admission::Admitted => return Ok(()),
                Admission::RetryAfter(wait) => {
                    tracing::trace!(wait_us = wait.as_micros() as u64, "Rate limiter full, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
