//! PostgreSQL Pools
//!
//! [`ConnectionPool`] backed by a lazily connecting `sqlx` pool. No connection
//! is opened until the first statement runs, so building the registry stays
//! synchronous.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo, ValueRef};
use uuid::Uuid;

use super::{
    ConnectionPool, Endpoint, PoolError, PoolFactory, QueryResult, Record, SqlType, SqlValue,
};
use crate::config::PoolSettings;

/// Pool of PostgreSQL connections to one host
pub struct PgConnectionPool {
    address: String,
    pool: PgPool,
}

impl PgConnectionPool {
    /// Create the pool without connecting
    #[must_use]
    pub fn connect_lazy(endpoint: &Endpoint, settings: &PoolSettings) -> Self {
        let options = PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.user)
            .password(&endpoint.password)
            .database(&endpoint.database);

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout())
            .idle_timeout(settings.idle_timeout())
            .connect_lazy_with(options);

        Self {
            address: endpoint.address(),
            pool,
        }
    }

    /// The underlying `sqlx` pool
    #[must_use]
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    fn endpoint(&self) -> &str {
        &self.address
    }

    async fn execute(
        &self,
        statement: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult, PoolError> {
        if self.pool.is_closed() {
            return Err(PoolError::Closed);
        }

        let query = params
            .iter()
            .fold(sqlx::query(statement), |query, value| bind_value(query, value));

        let result = if returns_rows(statement) {
            let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
            let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
            QueryResult::from_rows(rows)
        } else {
            let done = query.execute(&self.pool).await.map_err(map_sqlx_error)?;
            QueryResult {
                rows: Vec::new(),
                rows_affected: done.rows_affected(),
            }
        };

        tracing::trace!(
            endpoint = %self.address,
            rows = result.rows.len(),
            rows_affected = result.rows_affected,
            "Statement executed"
        );
        Ok(result)
    }

    async fn close(&self) -> Result<(), PoolError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Creates [`PgConnectionPool`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct PgPoolFactory;

impl PgPoolFactory {
    /// New factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PoolFactory for PgPoolFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        Ok(Arc::new(PgConnectionPool::connect_lazy(endpoint, settings)))
    }
}

// ============================================================================
// Value Conversion
// ============================================================================

/// Whether a statement produces a result set
///
/// Queries and anything with a `RETURNING` clause are fetched; the rest only
/// report affected rows.
fn returns_rows(statement: &str) -> bool {
    let upper = statement.to_ascii_uppercase();
    let head = upper
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();

    matches!(head, "SELECT" | "WITH" | "VALUES" | "SHOW" | "TABLE" | "EXPLAIN")
        || upper
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .any(|word| word == "RETURNING")
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null | SqlValue::TypedNull(SqlType::Text) => query.bind(None::<String>),
        SqlValue::TypedNull(SqlType::Bool) => query.bind(None::<bool>),
        SqlValue::TypedNull(SqlType::Int) => query.bind(None::<i64>),
        SqlValue::TypedNull(SqlType::Float) => query.bind(None::<f64>),
        SqlValue::TypedNull(SqlType::Uuid) => query.bind(None::<Uuid>),
        SqlValue::TypedNull(SqlType::Timestamp) => query.bind(None::<DateTime<Utc>>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
    }
}

fn decode_row(row: &PgRow) -> Result<Record, PoolError> {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, i, column.type_info().name())
            .map_err(|e| PoolError::Decode {
                column: column.name().to_string(),
                reason: e.to_string(),
            })?;
        record.push(column.name(), value);
    }
    Ok(record)
}

fn decode_column(row: &PgRow, i: usize, type_name: &str) -> Result<SqlValue, sqlx::Error> {
    if row.try_get_raw(i)?.is_null() {
        return Ok(SqlValue::Null);
    }

    let value = match type_name {
        "BOOL" => SqlValue::Bool(row.try_get(i)?),
        "INT2" => SqlValue::Int(i64::from(row.try_get::<i16, _>(i)?)),
        "INT4" => SqlValue::Int(i64::from(row.try_get::<i32, _>(i)?)),
        "INT8" => SqlValue::Int(row.try_get(i)?),
        "FLOAT4" => SqlValue::Float(f64::from(row.try_get::<f32, _>(i)?)),
        "FLOAT8" => SqlValue::Float(row.try_get(i)?),
        "UUID" => SqlValue::Uuid(row.try_get::<Uuid, _>(i)?),
        "TIMESTAMPTZ" => SqlValue::Timestamp(row.try_get::<DateTime<Utc>, _>(i)?),
        "TIMESTAMP" => SqlValue::Timestamp(row.try_get::<NaiveDateTime, _>(i)?.and_utc()),
        _ => SqlValue::Text(row.try_get::<String, _>(i)?),
    };
    Ok(value)
}

fn map_sqlx_error(error: sqlx::Error) -> PoolError {
    match error {
        sqlx::Error::PoolTimedOut => PoolError::Timeout,
        sqlx::Error::PoolClosed => PoolError::Closed,
        sqlx::Error::Io(e) => PoolError::ConnectionFailed(e.to_string()),
        sqlx::Error::Tls(e) => PoolError::ConnectionFailed(e.to_string()),
        sqlx::Error::Configuration(e) => PoolError::ConnectionFailed(e.to_string()),
        other => PoolError::Query(other.to_string()),
    }
}
