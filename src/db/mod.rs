//! Database abstraction layer for sqlgate.
//!
//! Provides a trait-based interface over pooled database connections, so the
//! executor and orchestrator can run against Postgres or an in-memory mock.

pub mod cache;
mod mock;
mod postgres;
mod schema;
mod types;

pub use cache::SchemaCache;
pub use mock::MockDatabasePool;
pub use postgres::PostgresPool;
pub use schema::{Column, ForeignKey, SchemaSnapshot, Table, TRUNCATION_MARKER};
pub use types::{ColumnInfo, Row, RowSet, Value};

use crate::config::DatabaseConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Session settings applied around a single statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// Server-side statement timeout.
    pub statement_timeout: Option<Duration>,

    /// Role to switch to for the statement.
    pub readonly_role: Option<String>,

    /// search_path for the statement.
    pub search_path: Option<String>,
}

/// Trait defining the interface for pooled database access.
///
/// All operations are async and return Results with GatewayError.
/// Connection-class failures must map to `GatewayError::Connection`,
/// statement timeouts to `GatewayError::ExecutionTimeout`.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Identifier of the configured database.
    fn name(&self) -> &str;

    /// Runs one statement in a read-only transaction and returns every row.
    async fn fetch(&self, sql: &str, options: &FetchOptions) -> Result<RowSet>;

    /// Introspects tables, columns and foreign keys.
    async fn introspect_schema(&self) -> Result<SchemaSnapshot>;

    /// Closes the pool; later calls fail.
    async fn close(&self);
}

/// Opens a Postgres pool for the given target.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn DatabasePool>> {
    let pool = PostgresPool::connect(config).await?;
    Ok(Arc::new(pool))
}
