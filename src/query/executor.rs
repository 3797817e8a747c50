//! Statement execution against a pooled database.
//!
//! Runs a validated statement under the session settings the policy asks
//! for, retries connection-class failures, truncates to the row cap and
//! normalizes every value to JSON.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SecurityPolicy;
use crate::db::{DatabasePool, FetchOptions, RowSet, SchemaSnapshot};
use crate::error::{GatewayError, Result};
use crate::resilience::{retry_with_backoff, DependencyGuard, RetryConfig};

/// Extra time the client waits beyond the server-side statement timeout, so
/// the server's own cancellation normally wins.
const CLIENT_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Rows of one executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// Column names in result order.
    pub columns: Vec<String>,
    /// Returned rows, at most `max_rows`.
    pub rows: Vec<Map<String, JsonValue>>,
    /// Rows the statement produced before truncation.
    pub total_row_count: usize,
    pub execution_time: Duration,
}

impl ExecutionOutcome {
    pub fn is_truncated(&self) -> bool {
        self.rows.len() < self.total_row_count
    }
}

/// Executes statements against one database.
#[derive(Clone)]
pub struct SqlExecutor {
    pool: Arc<dyn DatabasePool>,
    policy: Arc<SecurityPolicy>,
    guard: DependencyGuard,
    retry: RetryConfig,
}

impl SqlExecutor {
    /// `retry` should only list connection-class kinds; anything else it
    /// lists is retried as well.
    pub fn new(
        pool: Arc<dyn DatabasePool>,
        policy: Arc<SecurityPolicy>,
        guard: DependencyGuard,
        retry: RetryConfig,
    ) -> Self {
        Self {
            pool,
            policy,
            guard,
            retry,
        }
    }

    pub fn database(&self) -> &str {
        self.pool.name()
    }

    pub fn pool(&self) -> &Arc<dyn DatabasePool> {
        &self.pool
    }

    pub fn guard(&self) -> &DependencyGuard {
        &self.guard
    }

    /// Runs `sql` and returns at most `max_rows` rows.
    ///
    /// `timeout` and `max_rows` fall back to the policy's
    /// `max_execution_time_secs` and `max_rows`.
    pub async fn execute(
        &self,
        sql: &str,
        timeout: Option<Duration>,
        max_rows: Option<usize>,
    ) -> Result<ExecutionOutcome> {
        let timeout = timeout.unwrap_or_else(|| self.policy.max_execution_time());
        let max_rows = max_rows.unwrap_or(self.policy.max_rows);
        let options = self.fetch_options(timeout);

        let start = Instant::now();
        let row_set =
            retry_with_backoff(&self.retry, || self.fetch_once(sql, &options, timeout)).await?;
        let execution_time = start.elapsed();

        let outcome = normalize(row_set, max_rows, execution_time);
        info!(
            database = self.database(),
            rows = outcome.rows.len(),
            total_rows = outcome.total_row_count,
            elapsed_ms = execution_time.as_millis() as u64,
            "Statement executed"
        );
        Ok(outcome)
    }

    /// Introspects the schema through the same guard and retry policy.
    pub async fn introspect_schema(&self) -> Result<SchemaSnapshot> {
        debug!(database = self.database(), "Introspecting schema");
        retry_with_backoff(&self.retry, || {
            self.guard.call(|| self.pool.introspect_schema())
        })
        .await
    }

    fn fetch_options(&self, timeout: Duration) -> FetchOptions {
        FetchOptions {
            statement_timeout: Some(timeout),
            readonly_role: self
                .policy
                .readonly_role
                .clone()
                .filter(|r| !r.trim().is_empty()),
            search_path: Some(self.policy.safe_search_path.clone())
                .filter(|p| !p.trim().is_empty()),
        }
    }

    async fn fetch_once(
        &self,
        sql: &str,
        options: &FetchOptions,
        timeout: Duration,
    ) -> Result<RowSet> {
        self.guard
            .call(|| async {
                match tokio::time::timeout(timeout + CLIENT_TIMEOUT_GRACE, self.pool.fetch(sql, options))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::execution_timeout(format!(
                        "statement exceeded {}s",
                        timeout.as_secs_f64()
                    ))),
                }
            })
            .await
    }
}

impl std::fmt::Debug for SqlExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlExecutor")
            .field("database", &self.database())
            .field("guard", &self.guard)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Converts a row set to JSON rows keyed by column name, keeping the first
/// `max_rows`.
fn normalize(row_set: RowSet, max_rows: usize, execution_time: Duration) -> ExecutionOutcome {
    let total_row_count = row_set.len();
    let columns: Vec<String> = row_set.columns.into_iter().map(|c| c.name).collect();

    let rows = row_set
        .rows
        .into_iter()
        .take(max_rows)
        .map(|row| {
            columns
                .iter()
                .cloned()
                .zip(row.iter().map(|value| value.to_json()))
                .collect::<Map<String, JsonValue>>()
        })
        .collect();

    ExecutionOutcome {
        columns,
        rows,
        total_row_count,
        execution_time,
    }
}
