//! Token-bucket rate limiter.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use relay_types::DispatchError;

use crate::error::{LimitError, LimitResult};

/// Tolerance for float drift when comparing refilled tokens against one.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    fn take(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }
}

/// Token bucket with capacity `burst`, refilled at `requests_per_second`.
///
/// Waiters queue on a fair async mutex and the head of the queue sleeps
/// holding it, so tokens are handed out in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32) -> LimitResult<Self> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(LimitError::InvalidLimit {
                field: "requests_per_second",
                reason: format!("must be positive, got {requests_per_second}"),
            });
        }
        if burst == 0 {
            return Err(LimitError::InvalidLimit {
                field: "burst",
                reason: "must be at least 1".to_string(),
            });
        }
        let capacity = f64::from(burst);
        Ok(Self {
            rate: requests_per_second,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.capacity as u32
    }

    /// Wait for a token.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            bucket.refill(Instant::now(), self.rate, self.capacity);
            if bucket.take() {
                return;
            }
            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate);
            trace!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait for a token unless `cancel` fires first.
    pub async fn acquire_or_cancel(&self, cancel: &CancellationToken) -> Result<(), DispatchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::cancelled("cancelled while waiting for rate limit")),
            _ = self.acquire() => Ok(()),
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        match self.bucket.try_lock() {
            Ok(mut bucket) => {
                bucket.refill(Instant::now(), self.rate, self.capacity);
                bucket.take()
            }
            Err(_) => false,
        }
    }
}
