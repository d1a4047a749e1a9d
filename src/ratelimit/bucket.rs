//! Token bucket limiter implementation.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, TurnstileError};

/// Refill rate and burst capacity for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    rate: f64,
    burst: NonZeroU32,
}

impl Quota {
    /// Create a quota of `rate` tokens per second with room for `burst` tokens.
    ///
    /// The rate must be finite and strictly positive, the burst at least one.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "rate must be a positive number of tokens per second, got {}",
                rate
            )));
        }
        let burst = NonZeroU32::new(burst)
            .ok_or_else(|| TurnstileError::Config("bucket must be at least 1".to_string()))?;
        Ok(Self { rate, burst })
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn burst(&self) -> u32 {
        self.burst.get()
    }
}

/// Mutable accounting guarded by the bucket's lock.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// A token bucket rate limiter.
///
/// Tokens refill continuously at `rate` per second up to `capacity`, and each
/// admitted call consumes one. Buckets start full. The check-and-decrement
/// runs under a per-bucket mutex, so concurrent callers sharing one bucket
/// can never admit more than the bucket holds.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket for the given quota.
    pub fn new(quota: &Quota) -> Self {
        Self::new_at(quota, Instant::now())
    }

    pub(crate) fn new_at(quota: &Quota, now: Instant) -> Self {
        let capacity = f64::from(quota.burst());
        Self {
            rate: quota.rate(),
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: now,
            }),
        }
    }

    /// Try to take one token.
    ///
    /// Returns `true` if the action is admitted, `false` if the bucket is empty.
    pub fn allow(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Try to take one token, reporting how long until one becomes available
    /// when the bucket is empty.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            // Very slow rates can need longer than a Duration holds
            Err(Duration::try_from_secs_f64(missing / self.rate).unwrap_or(Duration::MAX))
        }
    }

    /// Current token count, including tokens accrued since the last call.
    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    pub(crate) fn tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum number of tokens this bucket holds.
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // An earlier `now` than the last update counts as no time passing.
        let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        if now > state.last_update {
            state.last_update = now;
        }
    }
}
