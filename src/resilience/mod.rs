//! Retry, circuit breaking and rate limiting for external dependencies.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use rate_limiter::RateLimiter;
pub use retry::{retry_with_backoff, RetryConfig, RetryState};

use crate::config::{RateLimitConfig, ResilienceConfig};
use crate::error::{GatewayError, Result};
use std::future::Future;
use std::sync::Arc;

/// The shared rate limiter and circuit breaker guarding one dependency.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct DependencyGuard {
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
}

impl DependencyGuard {
    pub fn new(limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { limiter, breaker }
    }

    /// Builds a guard from settings, with `calls_per_minute` as the rate ceiling.
    pub fn from_settings(
        name: &str,
        calls_per_minute: u32,
        rate_limit: &RateLimitConfig,
        resilience: &ResilienceConfig,
    ) -> Self {
        let limiter = if rate_limit.enabled {
            RateLimiter::per_minute(name, calls_per_minute, rate_limit.max_wait())
        } else {
            RateLimiter::unlimited(name)
        };
        let breaker = CircuitBreaker::new(
            name,
            resilience.circuit_breaker_threshold,
            resilience.circuit_breaker_timeout(),
        );
        Self::new(Arc::new(limiter), Arc::new(breaker))
    }

    /// No rate ceiling and a breaker that effectively never opens.
    pub fn unguarded(name: &str) -> Self {
        Self::new(
            Arc::new(RateLimiter::unlimited(name)),
            Arc::new(CircuitBreaker::new(
                name,
                u32::MAX,
                std::time::Duration::ZERO,
            )),
        )
    }

    /// Takes a rate-limit token, then runs `operation` through the breaker.
    ///
    /// An open circuit fails fast before a token is taken. If the circuit
    /// opens while the caller waits for its token, the token is returned.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.breaker.is_rejecting() {
            return Err(GatewayError::circuit_open(self.breaker.name()));
        }
        self.limiter.acquire().await?;

        let result = self.breaker.call(operation).await;
        if matches!(result, Err(GatewayError::CircuitOpen(_))) {
            self.limiter.release();
        }
        result
    }
}
