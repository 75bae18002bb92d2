//! Token-bucket rate limiting for upstream calls.
//!
//! Every call to the upstream (including summarization calls made by the
//! compactor) takes one token. The bucket starts full, refills continuously
//! at `per_minute / 60` tokens per second and never holds more than `burst`.

use std::sync::Mutex;
use std::time::Duration;

use pincer_config::RateLimitConfig;
use pincer_core::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_BURST: f64 = 5.0;
const DEFAULT_PER_MINUTE: f64 = 30.0;

/// Shortest sleep between refill checks; keeps float rounding from
/// producing zero-length waits.
const MIN_WAIT: Duration = Duration::from_millis(1);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket. Safe to use from many concurrent turns.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    max_tokens: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    /// Create a limiter holding at most `burst` tokens and refilling at
    /// `per_minute` tokens per minute. Non-positive values fall back to the
    /// defaults (5 and 30).
    pub fn new(burst: u32, per_minute: f64) -> Self {
        let max_tokens = if burst == 0 {
            DEFAULT_BURST
        } else {
            f64::from(burst)
        };
        let per_minute = if per_minute.is_finite() && per_minute > 0.0 {
            per_minute
        } else {
            DEFAULT_PER_MINUTE
        };

        Self {
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            max_tokens,
            refill_per_sec: per_minute / 60.0,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.burst, config.per_minute)
    }

    /// Tokens currently available, after accounting for elapsed refill.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Wait until a token is available and take it.
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires, including when
    /// it was already cancelled on entry.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Error> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let delay = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(delay) => delay,
            };

            debug!(wait_ms = delay.as_millis() as u64, "Rate limit reached, waiting");

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Take a token, or report how long until one is available.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - bucket.tokens;
        let delay = Duration::from_secs_f64(deficit / self.refill_per_sec);
        Err(delay.max(MIN_WAIT))
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_refill = now;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BURST as u32, DEFAULT_PER_MINUTE)
    }
}
