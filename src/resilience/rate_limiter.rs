//! Token-bucket rate limiter with bounded queuing.
//!
//! Each call takes one token. When the bucket is empty the caller reserves
//! the next token and sleeps until it is due; if that wait would exceed
//! `max_wait` the call is rejected with [`GatewayError::RateLimitExceeded`].

use crate::error::{GatewayError, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    /// May go negative: each queued caller holds a reservation.
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    max_wait: Duration,
    enabled: bool,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Allows `calls_per_minute` calls, with bursts up to the same amount.
    pub fn per_minute(name: impl Into<String>, calls_per_minute: u32, max_wait: Duration) -> Self {
        let capacity = f64::from(calls_per_minute.max(1));
        Self {
            name: name.into(),
            capacity,
            refill_per_sec: capacity / 60.0,
            max_wait,
            enabled: true,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits or rejects.
    pub fn unlimited(name: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::per_minute(name, u32::MAX, Duration::ZERO)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tokens currently available (negative while callers are queued).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Waits for a token, or fails if none can be had within `max_wait`.
    pub async fn acquire(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let wait = {
            let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
            self.refill(&mut bucket);

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }

            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec);
            if wait > self.max_wait {
                debug!(
                    limiter = %self.name,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit exceeded"
                );
                return Err(GatewayError::rate_limited(&self.name));
            }
            bucket.tokens -= 1.0;
            wait
        };

        debug!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
        tokio::time::sleep(wait).await;
        Ok(())
    }

    /// Returns a token taken by a call that never reached the dependency.
    pub fn release(&self) {
        if !self.enabled {
            return;
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens = (bucket.tokens + 1.0).min(self.capacity);
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}
