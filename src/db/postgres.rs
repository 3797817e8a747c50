//! PostgreSQL pool implementation.
//!
//! Provides `PostgresPool`, which implements `DatabasePool` over a sqlx
//! `PgPool`. Every statement runs inside its own read-only transaction that
//! is always rolled back.

use crate::config::DatabaseConfig;
use crate::db::{
    Column, ColumnInfo, DatabasePool, FetchOptions, ForeignKey, Row, RowSet, SchemaSnapshot,
    Table, Value,
};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// Schemas never shown to the model.
const SYSTEM_SCHEMAS: &str = "('pg_catalog', 'information_schema')";

/// PostgreSQL connection pool for one configured database.
#[derive(Debug)]
pub struct PostgresPool {
    name: String,
    pool: PgPool,
}

impl PostgresPool {
    /// Opens the pool, establishing `min_pool_size` connections up front.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .application_name("sqlgate");

        debug!(database = %config.name, target = %config.display_string(), "Opening pool");

        let pool = PgPoolOptions::new()
            .min_connections(config.min_pool_size)
            .max_connections(config.max_pool_size)
            .acquire_timeout(config.pool_timeout())
            .connect_with(options)
            .await
            .map_err(|e| map_connect_error(e, config))?;

        Ok(Self {
            name: config.name.clone(),
            pool,
        })
    }

    /// Wraps an existing pool.
    pub fn from_pool(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, sql: &str, options: &FetchOptions) -> Result<RowSet> {
        let mut tx = self.pool.begin().await.map_err(classify_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(classify_error)?;

        if let Some(timeout) = options.statement_timeout {
            set_local(&mut tx, "statement_timeout", &format!("{}ms", timeout.as_millis())).await?;
        }
        if let Some(role) = &options.readonly_role {
            set_local(&mut tx, "role", role).await?;
        }
        if let Some(path) = &options.search_path {
            set_local(&mut tx, "search_path", path).await?;
        }

        // Extended protocol: the server rejects more than one command, so the
        // statement cannot end the read-only transaction early.
        let rows: Vec<PgRow> = sqlx::query(sql)
            .persistent(false)
            .fetch_all(&mut *tx)
            .await
            .map_err(classify_error)?;

        if let Err(e) = tx.rollback().await {
            debug!(database = %self.name, error = %e, "Rollback after read failed");
        }

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(RowSet::new(columns, rows.iter().map(convert_row).collect()))
    }

    async fn introspect_schema(&self) -> Result<SchemaSnapshot> {
        let mut tables = self.fetch_tables().await?;
        let primary_keys = self.fetch_primary_keys().await?;

        for table in &mut tables {
            for column in &mut table.columns {
                let key = (table.schema.clone(), table.name.clone(), column.name.clone());
                if primary_keys.contains(&key) {
                    column.is_primary_key = true;
                }
            }
        }

        Ok(SchemaSnapshot {
            database: self.name.clone(),
            tables,
            foreign_keys: self.fetch_foreign_keys().await?,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Runs `set_config(name, value, true)`, which scopes the setting to the
/// current transaction like `SET LOCAL` but takes the value as a parameter.
async fn set_local(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    name: &str,
    value: &str,
) -> Result<()> {
    sqlx::query("SELECT set_config($1, $2, true)")
        .bind(name)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(classify_error)?;
    Ok(())
}

impl PostgresPool {
    /// Fetches every column of every user table and view, in ordinal order.
    async fn fetch_tables(&self) -> Result<Vec<Table>> {
        let query = format!(
            r#"
            SELECT
                c.table_schema::text,
                c.table_name::text,
                c.column_name::text,
                c.data_type::text,
                c.is_nullable::text,
                c.column_default::text
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_schema = c.table_schema AND t.table_name = c.table_name
            WHERE c.table_schema NOT IN {SYSTEM_SCHEMAS}
                AND c.table_schema NOT LIKE 'pg_toast%'
                AND t.table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY c.table_schema, c.table_name, c.ordinal_position
            "#
        );

        let rows: Vec<(String, String, String, String, String, Option<String>)> =
            sqlx::query_as(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| with_context(classify_error(e), "Failed to fetch columns"))?;

        let mut tables: Vec<Table> = Vec::new();
        for (schema, table, name, data_type, is_nullable, default) in rows {
            let same_table = tables
                .last()
                .is_some_and(|t| t.schema == schema && t.name == table);
            if !same_table {
                tables.push(Table::new(schema, table));
            }
            if let Some(current) = tables.last_mut() {
                current.columns.push(Column {
                    name,
                    data_type,
                    is_nullable: is_nullable == "YES",
                    is_primary_key: false,
                    default,
                });
            }
        }

        Ok(tables)
    }

    /// Returns `(schema, table, column)` for every primary key column.
    async fn fetch_primary_keys(&self) -> Result<HashSet<(String, String, String)>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT kcu.table_schema::text, kcu.table_name::text, kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| with_context(classify_error(e), "Failed to fetch primary keys"))?;

        Ok(rows.into_iter().collect())
    }

    /// Fetches foreign keys, grouped by constraint.
    async fn fetch_foreign_keys(&self) -> Result<Vec<ForeignKey>> {
        let query = format!(
            r#"
            SELECT
                tc.table_schema::text,
                tc.constraint_name::text,
                kcu.table_schema::text,
                kcu.table_name::text,
                kcu.column_name::text,
                ccu.table_schema::text,
                ccu.table_name::text,
                ccu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
                AND tc.table_schema NOT IN {SYSTEM_SCHEMAS}
            ORDER BY tc.table_schema, tc.constraint_name, kcu.ordinal_position
            "#
        );

        type FkRow = (String, String, String, String, String, String, String, String);
        let rows: Vec<FkRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| with_context(classify_error(e), "Failed to fetch foreign keys"))?;

        let mut grouped: BTreeMap<(String, String), ForeignKey> = BTreeMap::new();
        for (constraint_schema, constraint, from_schema, from_table, from_col, to_schema, to_table, to_col) in
            rows
        {
            let fk = grouped
                .entry((constraint_schema, constraint))
                .or_insert_with(|| {
                    ForeignKey::new(
                        qualify(&from_schema, &from_table),
                        Vec::new(),
                        qualify(&to_schema, &to_table),
                        Vec::new(),
                    )
                });
            if !fk.from_columns.contains(&from_col) {
                fk.from_columns.push(from_col);
            }
            if !fk.to_columns.contains(&to_col) {
                fk.to_columns.push(to_col);
            }
        }

        Ok(grouped.into_values().collect())
    }
}

fn qualify(schema: &str, table: &str) -> String {
    Table::new(schema, table).qualified_name()
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Decodes one column, dispatching on the Postgres type name.
///
/// Anything without a dedicated decoder is read back as its text form.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(index).ok().flatten()
    }

    fn array<'r, T>(row: &'r PgRow, index: usize) -> Option<Value>
    where
        T: Into<Value>,
        Vec<Option<T>>: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        get::<Vec<Option<T>>>(row, index)
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect()))
    }

    let value = match type_name.to_uppercase().as_str() {
        "BOOL" => get::<bool>(row, index).map(Value::Bool),
        "INT2" => get::<i16>(row, index).map(|v| Value::Int(v.into())),
        "INT4" => get::<i32>(row, index).map(|v| Value::Int(v.into())),
        "INT8" => get::<i64>(row, index).map(Value::Int),
        "FLOAT4" => get::<f32>(row, index).map(|v| Value::Float(v.into())),
        "FLOAT8" => get::<f64>(row, index).map(Value::Float),
        "NUMERIC" => get::<BigDecimal>(row, index).map(|v| Value::Decimal(v.to_string())),
        "BYTEA" => get::<Vec<u8>>(row, index).map(Value::Bytes),
        "TIMESTAMP" => get::<NaiveDateTime>(row, index).map(Value::Timestamp),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, index).map(Value::TimestampTz),
        "DATE" => get::<NaiveDate>(row, index).map(Value::Date),
        "TIME" => get::<NaiveTime>(row, index).map(Value::Time),
        "UUID" => get::<Uuid>(row, index).map(Value::Uuid),
        "JSON" | "JSONB" => get::<serde_json::Value>(row, index).map(Value::Json),
        "BOOL[]" => array::<bool>(row, index),
        "INT4[]" => array::<i32>(row, index),
        "INT8[]" => array::<i64>(row, index),
        "FLOAT8[]" => array::<f64>(row, index),
        "TEXT[]" | "VARCHAR[]" => array::<String>(row, index),
        "NUMERIC[]" => get::<Vec<Option<BigDecimal>>>(row, index).map(|items| {
            Value::Array(
                items
                    .into_iter()
                    .map(|v| v.map_or(Value::Null, |d| Value::Decimal(d.to_string())))
                    .collect(),
            )
        }),
        _ => text(row, index).map(Value::String),
    };

    match value {
        Some(value) => value,
        None if row_is_null(row, index) => Value::Null,
        // A decoder mismatch should not lose the value entirely.
        None => text(row, index).map(Value::String).unwrap_or(Value::Null),
    }
}

/// Reads a column as UTF-8 text, whatever its declared type.
///
/// Binary-format values of types without a decoder (enums, citext, ...)
/// are UTF-8 on the wire; anything else fails and reads as NULL.
fn text(row: &PgRow, index: usize) -> Option<String> {
    row.try_get_unchecked::<Option<String>, _>(index)
        .ok()
        .flatten()
}

fn row_is_null(row: &PgRow, index: usize) -> bool {
    use sqlx::ValueRef;
    row.try_get_raw(index).map(|v| v.is_null()).unwrap_or(true)
}

/// Maps a sqlx error onto the gateway taxonomy.
///
/// Pool exhaustion, I/O failures, SQLSTATE class 08 and server shutdown codes
/// are connection-class; SQLSTATE 57014 (query_canceled) is a statement
/// timeout; everything else is a statement error.
pub fn classify_error(error: sqlx::Error) -> GatewayError {
    match &error {
        sqlx::Error::PoolTimedOut => {
            GatewayError::connection("Timed out waiting for a pooled connection")
        }
        sqlx::Error::PoolClosed => GatewayError::connection("Connection pool is closed"),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => {
            GatewayError::connection(error.to_string())
        }
        sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
            Some("57014") => GatewayError::execution_timeout(db_error.message().to_string()),
            Some(code) if is_connection_sqlstate(code) => {
                GatewayError::connection(db_error.message().to_string())
            }
            _ => GatewayError::database(format_query_error(&error)),
        },
        _ => GatewayError::database(error.to_string()),
    }
}

fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "53300" | "57P01" | "57P02" | "57P03")
}

fn with_context(error: GatewayError, context: &str) -> GatewayError {
    match error {
        GatewayError::Database(msg) => GatewayError::database(format!("{context}: {msg}")),
        other => other,
    }
}

/// Maps errors raised while opening the pool to readable messages.
fn map_connect_error(error: sqlx::Error, config: &DatabaseConfig) -> GatewayError {
    let error_str = error.to_string().to_lowercase();
    let (host, port) = (&config.host, config.port);

    let message = if error_str.contains("connection refused") {
        format!("Cannot connect to {host}:{port}. Check that the server is running.")
    } else if error_str.contains("password authentication failed") {
        format!(
            "Authentication failed for user '{}'. Check your credentials.",
            config.user
        )
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        format!("Database '{}' does not exist.", config.database)
    } else if matches!(error, sqlx::Error::PoolTimedOut) || error_str.contains("timed out") {
        format!("Connection to {host}:{port} timed out.")
    } else {
        error.to_string()
    };

    warn!(database = %config.name, "{message}");
    GatewayError::connection(format!("{}: {message}", config.name))
}

/// Formats a statement error with the server's detail and hint, if any.
fn format_query_error(error: &sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = db_error.message().to_string();
    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
    }
    result
}
