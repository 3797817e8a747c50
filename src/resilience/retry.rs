//! Exponential-backoff retry for fallible async operations.

use crate::config::ResilienceConfig;
use crate::error::{ErrorKind, GatewayError, Result};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Parameters for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    retriable: HashSet<ErrorKind>,
}

impl RetryConfig {
    /// Creates a retry configuration, checking that
    /// `max_attempts >= 1`, `backoff_factor >= 1` and `max_delay >= initial_delay`.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
        retriable: HashSet<ErrorKind>,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(GatewayError::config("max_attempts must be at least 1"));
        }
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            return Err(GatewayError::config("backoff_factor must be at least 1.0"));
        }
        if max_delay < initial_delay {
            return Err(GatewayError::config(
                "max_delay must not be smaller than initial_delay",
            ));
        }
        if retriable.contains(&ErrorKind::Parse)
            || retriable.contains(&ErrorKind::SecurityViolation)
        {
            return Err(GatewayError::config(
                "parse errors and security violations cannot be retried",
            ));
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            backoff_factor,
            max_delay,
            retriable,
        })
    }

    /// Builds a configuration from the resilience settings.
    pub fn from_settings(settings: &ResilienceConfig, retriable: HashSet<ErrorKind>) -> Result<Self> {
        Self::new(
            settings.max_attempts,
            settings.retry_delay(),
            settings.backoff_factor,
            settings.max_delay(),
            retriable,
        )
    }

    /// Kinds retried when nothing else is specified: connection-class
    /// database failures and model transport failures.
    pub fn default_retriable() -> HashSet<ErrorKind> {
        [ErrorKind::Connection, ErrorKind::LlmTimeout, ErrorKind::Llm]
            .into_iter()
            .collect()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn is_retriable(&self, err: &GatewayError) -> bool {
        self.retriable.contains(&err.kind())
    }

    /// Delay that follows `current`: `min(current * backoff_factor, max_delay)`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            retriable: Self::default_retriable(),
        }
    }
}

/// Progress of one retried operation.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempts started so far.
    pub attempt: u32,
    pub last_error: Option<GatewayError>,
    /// Delay to sleep before the next attempt.
    pub delay: Duration,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            last_error: None,
            delay: config.initial_delay,
        }
    }

    /// Starts a new attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn has_remaining(&self, config: &RetryConfig) -> bool {
        self.attempt < config.max_attempts
    }

    /// Records a failure and returns the delay to wait before the next attempt.
    pub fn record_failure(&mut self, err: GatewayError, config: &RetryConfig) -> Duration {
        let delay = self.delay;
        self.delay = config.next_delay(delay);
        self.last_error = Some(err);
        delay
    }
}

/// Runs `operation` until it succeeds, fails with a non-retriable error, or
/// the attempt budget is spent. The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::new(config);

    loop {
        let attempt = state.begin_attempt();
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !config.is_retriable(&e) => return Err(e),
            Err(e) if !state.has_remaining(config) => {
                warn!(attempts = attempt, error = %e, "Giving up after retries");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = state.delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                let delay = state.record_failure(e, config);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
