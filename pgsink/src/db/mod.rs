//! Capability interface over the database: execute, query, transactions,
//! bulk insert, liveness. The engine only ever talks to these traits; the
//! `postgres` module binds them to tokio-postgres and `mock` provides the
//! in-memory implementation the tests drive.

pub mod mock;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use models::Column;
use snafu::Snafu;

pub type DbResult<T, E = DbError> = std::result::Result<T, E>;

/// Whether retrying the whole write cycle later could succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Connectivity, cancellation, resource pressure, lock ordering races.
    /// Propagated to the caller; the batch is retried.
    Transient,
    /// The statement will fail the same way every time. Recovered at the
    /// narrowest scope (column, field, or sub-batch).
    Permanent,
}

/// Error surfaced by a database implementation.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(display("{message}"))]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
    pub sqlstate: Option<String>,
}

impl DbError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Transient,
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Permanent,
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn with_sqlstate(mut self, code: impl Into<String>) -> Self {
        self.sqlstate = Some(code.into());
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == DbErrorKind::Transient
    }
}

/// Driver-neutral parameter / result value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// One result row, column access by name.
#[derive(Debug, Clone, Default)]
pub struct DbRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl DbRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(SqlValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(SqlValue::I64(v)) => Some(*v),
            _ => None,
        }
    }
}

/// Lazy, restartable producer of row tuples for bulk insertion.
///
/// `next` advances the cursor and reports whether a row is available;
/// `values` materializes the current row; `reset` rewinds so a retried
/// write observes the full sequence again.
pub trait RowSource: Send {
    fn next(&mut self) -> bool;
    fn values(&self) -> crate::error::Result<Vec<SqlValue>>;
    fn reset(&mut self);
}

/// Statement execution shared by connections and transactions.
#[async_trait]
pub trait DbConn: Send {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64>;

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>>;

    /// Insert every row `rows` yields into `table` (a pre-quoted, qualified
    /// identifier), columns in the given order. Returns the row count.
    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: &mut dyn RowSource,
    ) -> DbResult<u64>;
}

/// An open transaction. Dropped without commit, it rolls back.
#[async_trait]
pub trait DbTx: DbConn {
    async fn commit(self: Box<Self>) -> DbResult<()>;
    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

/// A database connection.
#[async_trait]
pub trait Db: DbConn {
    async fn begin<'a>(&'a mut self) -> DbResult<Box<dyn DbTx + Send + 'a>>;

    /// Round-trip health probe.
    async fn is_alive(&mut self) -> bool;
}
