//! Mock database pool for testing.
//!
//! Returns a fixed row set and schema, can fail on demand, and records every
//! statement it is asked to run.

use super::{DatabasePool, FetchOptions, RowSet, SchemaSnapshot};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A mock pool that returns predefined results.
#[derive(Debug)]
pub struct MockDatabasePool {
    name: String,
    schema: SchemaSnapshot,
    rows: RowSet,
    fetch_failures: Mutex<VecDeque<GatewayError>>,
    fetch_delay: Option<Duration>,
    introspect_delay: Option<Duration>,
    fetch_calls: AtomicUsize,
    introspect_calls: AtomicUsize,
    executed: Mutex<Vec<(String, FetchOptions)>>,
    closed: AtomicBool,
}

impl MockDatabasePool {
    /// Creates a pool with an empty schema and no rows.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            schema: SchemaSnapshot::new(name.clone()),
            name,
            rows: RowSet::default(),
            fetch_failures: Mutex::new(VecDeque::new()),
            fetch_delay: None,
            introspect_delay: None,
            fetch_calls: AtomicUsize::new(0),
            introspect_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the schema; its database identifier is forced to the pool name.
    pub fn with_schema(mut self, schema: SchemaSnapshot) -> Self {
        self.schema = SchemaSnapshot {
            database: self.name.clone(),
            ..schema
        };
        self
    }

    pub fn with_rows(mut self, rows: RowSet) -> Self {
        self.rows = rows;
        self
    }

    /// Queues errors returned by the next `fetch` calls, in order.
    pub fn with_fetch_failures(self, failures: impl IntoIterator<Item = GatewayError>) -> Self {
        self.fetch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(failures);
        self
    }

    /// Makes every `fetch` sleep before answering.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Makes every `introspect_schema` sleep before answering.
    pub fn with_introspect_delay(mut self, delay: Duration) -> Self {
        self.introspect_delay = Some(delay);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn introspect_count(&self) -> usize {
        self.introspect_calls.load(Ordering::SeqCst)
    }

    /// Statements passed to `fetch`, oldest first.
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn last_options(&self) -> Option<FetchOptions> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|(_, options)| options.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabasePool for MockDatabasePool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, sql: &str, options: &FetchOptions) -> Result<RowSet> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((sql.to_string(), options.clone()));

        if self.is_closed() {
            return Err(GatewayError::connection("pool is closed"));
        }
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .fetch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match failure {
            Some(err) => Err(err),
            None => Ok(self.rows.clone()),
        }
    }

    async fn introspect_schema(&self) -> Result<SchemaSnapshot> {
        self.introspect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.introspect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(GatewayError::connection("pool is closed"));
        }
        Ok(self.schema.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
