//! Consecutive-failure circuit breaker.
//!
//! Guards one external dependency. After `threshold` consecutive dependency
//! failures the circuit opens and calls fail fast with
//! [`GatewayError::CircuitOpen`] until the cooldown elapses. The first call
//! after the cooldown runs as the single half-open trial; its outcome either
//! closes the circuit or reopens it with a fresh cooldown.

use crate::error::{GatewayError, Result};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// True if a call made now would fail fast with `CircuitOpen`.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|at| at.elapsed() < self.cooldown),
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    /// Runs `operation` through the breaker.
    ///
    /// Only errors whose kind is a dependency failure count against the
    /// circuit; any other outcome counts as the dependency being healthy.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.admit()?;
        let result = operation().await;

        let failed = matches!(&result, Err(e) if e.kind().is_dependency_failure());
        guard.finish(failed);
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The state is plain data; a poisoned lock still holds a usable value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn admit(&self) -> Result<CallGuard<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if !cooled {
                    return Err(GatewayError::circuit_open(&self.name));
                }
                info!(breaker = %self.name, "Circuit half-open, admitting trial");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(GatewayError::circuit_open(&self.name));
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Ok(CallGuard {
            breaker: self,
            trial,
            finished: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if trial && inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "Trial succeeded, circuit closed");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.trial_in_flight = false;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                warn!(breaker = %self.name, "Trial failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs_f64(),
                        "Circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            // Late results from calls admitted before the circuit opened.
            _ => inner.consecutive_failures += 1,
        }
    }
}

/// Records the outcome of an admitted call; a call dropped before finishing
/// (timed out or cancelled) counts as a failure.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    finished: bool,
}

impl CallGuard<'_> {
    fn finish(&mut self, failed: bool) {
        self.finished = true;
        if failed {
            self.breaker.on_failure(self.trial);
        } else {
            self.breaker.on_success(self.trial);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.on_failure(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err(GatewayError::connection("refused")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("db", 3, Duration::from_secs(60));

        for _ in 0..2 {
            assert!(fail(&breaker).await.is_err());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<()> = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::CircuitOpen(ref n)) if n == "db"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new("llm", 3, Duration::from_secs(60));

        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.consecutive_failures(), 0);

        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_dependency_errors_do_not_count() {
        let breaker = CircuitBreaker::new("db", 1, Duration::from_secs(60));

        let result: Result<()> = breaker
            .call(|| async { Err(GatewayError::database("column \"x\" does not exist")) })
            .await;

        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes() {
        let breaker = CircuitBreaker::new("db", 1, Duration::from_secs(60));
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        succeed(&breaker).await.unwrap();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new("db", 1, Duration::from_secs(60));
        fail(&breaker).await.ok();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(GatewayError::CircuitOpen(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_admitted() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("llm", 1, Duration::from_secs(10)));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(11)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    wait.await.ok();
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(matches!(
            succeed(&breaker).await,
            Err(GatewayError::CircuitOpen(_))
        ));

        release.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let breaker = CircuitBreaker::new("llm", 1, Duration::from_secs(10));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(11)).await;

        let slow = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), slow).await;

        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
