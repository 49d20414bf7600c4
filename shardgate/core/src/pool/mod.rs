//! Connection Pool Contract
//!
//! The shard layer never talks to a database directly. It owns one
//! [`ConnectionPool`] per (shard, role) pair and hands those out to callers,
//! who execute their own statements against them.
//!
//! # Design
//!
//! Pools are created by a [`PoolFactory`] while the registry is built.
//! Creation is synchronous and never connects: connection establishment is
//! deferred to the first `execute`, so `initialize` has no suspension points.
//!
//! Two adapters ship with the crate:
//! - [`postgres`]: `sqlx` pools, behind the default `postgres` feature
//! - [`scripted`]: in-memory pools with canned rows and injected failures

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::PoolSettings;

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod scripted;

// ============================================================================
// Pool Contract
// ============================================================================

/// An asynchronous database connection pool bound to one host
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Address this pool connects to
    fn endpoint(&self) -> &str;

    /// Execute a statement with positional parameters
    async fn execute(&self, statement: &str, params: &[SqlValue]) -> Result<QueryResult, PoolError>;

    /// Close the pool, waiting for checked-out connections to be released
    ///
    /// Closing an already closed pool succeeds.
    async fn close(&self) -> Result<(), PoolError>;
}

/// Builds pools for the registry
pub trait PoolFactory: Send + Sync {
    /// Create a pool for the given endpoint without connecting
    fn create(
        &self,
        endpoint: &Endpoint,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError>;
}

/// Connection target for a single pool
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
    /// Database name
    pub database: String,
}

impl Endpoint {
    /// `host:port/database`, safe to log
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Which pool of a shard a handle refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolRole {
    /// The single write-capable pool
    Writer,
    /// A read replica pool, by position in the shard's reader list
    Reader(usize),
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Writer => write!(f, "writer"),
            Self::Reader(i) => write!(f, "reader[{i}]"),
        }
    }
}

// ============================================================================
// Values and Rows
// ============================================================================

/// Column type given to a NULL parameter
///
/// The server infers a parameter's type from the bound value. A bare NULL
/// carries no type of its own, so it is sent as TEXT.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SqlType {
    /// `BOOL`
    Bool,
    /// `INT8`
    Int,
    /// `FLOAT8`
    Float,
    /// `TEXT`
    Text,
    /// `UUID`
    Uuid,
    /// `TIMESTAMPTZ`
    Timestamp,
}

/// A positional parameter or a column value
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    /// SQL NULL, bound as TEXT
    ///
    /// Comparing it against a non-text column fails on the server. Use
    /// [`SqlValue::TypedNull`] or cast the placeholder (`$1::uuid`) instead.
    Null,
    /// SQL NULL bound with an explicit column type
    TypedNull(SqlType),
    /// Boolean
    Bool(bool),
    /// Any integer width
    Int(i64),
    /// Any float width
    Float(f64),
    /// Text-like columns
    Text(String),
    /// UUID columns
    Uuid(Uuid),
    /// Timestamps, normalized to UTC
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Rank used when comparing values of different types
    fn type_rank(&self) -> u8 {
        match self {
            Self::Null | Self::TypedNull(_) => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::Text(_) => 3,
            Self::Uuid(_) => 4,
            Self::Timestamp(_) => 5,
        }
    }

    /// Total order used for sorting merged rows
    ///
    /// NULL sorts lowest. Integers and floats compare numerically; other
    /// mixed-type pairs fall back to a fixed type rank.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).total_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.total_cmp(&(*b as f64)),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Whether this is SQL NULL, typed or not
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::TypedNull(_))
    }

    /// NULL of the given type, or the value itself
    #[must_use]
    pub fn nullable<T: Into<SqlValue>>(value: Option<T>, kind: SqlType) -> Self {
        value.map_or(Self::TypedNull(kind), Into::into)
    }

    /// Text value, if this is text
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// UUID value; text holding a UUID is accepted too
    #[must_use]
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(id) => Some(*id),
            Self::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    /// Timestamp value, if this is a timestamp
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Integer value, if this is an integer
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// One result row: column names with values, in select order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, SqlValue)>,
}

impl Record {
    /// Empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column append
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, value);
        self
    }

    /// Append a column
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.push((column.into(), value.into()));
    }

    /// Value of the first column with this name
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Column names in order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Number of columns
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the record has no columns
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Outcome of a statement
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    /// Returned rows (empty for statements without a result set)
    pub rows: Vec<Record>,
    /// Rows inserted, updated or deleted
    pub rows_affected: u64,
}

impl QueryResult {
    /// Result of a row-returning statement
    #[must_use]
    pub fn from_rows(rows: Vec<Record>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            rows,
            rows_affected,
        }
    }

    /// First row, if any
    #[must_use]
    pub fn first(&self) -> Option<&Record> {
        self.rows.first()
    }
}

// ============================================================================
// Pool Errors
// ============================================================================

/// Failures reported by a pool
#[derive(Clone, Debug, Error)]
pub enum PoolError {
    /// The pool has been closed
    #[error("connection pool is closed")]
    Closed,

    /// No connection became available in time
    #[error("timed out waiting for a connection")]
    Timeout,

    /// Connecting to the database failed
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),

    /// The database rejected the statement
    #[error("query failed: {0}")]
    Query(String),

    /// A column could not be converted into a [`SqlValue`]
    #[error("cannot decode column {column}: {reason}")]
    Decode {
        /// Column name
        column: String,
        /// What went wrong
        reason: String,
    },
}

impl PoolError {
    /// Whether the failure is about reaching the database rather than the statement
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_))
    }
}
