//! Backend connector seam.
//!
//! A [`BackendConnector`] knows how to open connections for one backend and
//! how to describe that backend's catalog. A [`BackendConnection`] executes
//! raw SQL; it is owned by the engine's consumer thread and never shared.
//!
//! Only SQLite ships with the crate. Other backends plug in through
//! [`Database::with_connector`](crate::Database::with_connector).

pub mod sqlite;

pub use sqlite::SqliteConnector;

use std::fmt;
use thiserror::Error;

use crate::codec::Dialect;
use crate::error::Result;
use crate::query::create_table_sql;
use crate::schema::TableSchema;
use crate::value::Value;

/// Undecoded result rows, cells in select order.
pub type RawRows = Vec<Vec<Value>>;

/// Whether a failure is confined to one statement or takes the connection
/// down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The statement was rejected; the connection remains usable.
    Statement,
    /// The connection is unusable and must be replaced.
    Connection,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement => f.write_str("statement"),
            Self::Connection => f.write_str("connection"),
        }
    }
}

/// An error reported by a backend driver.
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Statement,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Connection,
            message: message.into(),
        }
    }

    pub fn is_connection(&self) -> bool {
        self.kind == BackendErrorKind::Connection
    }
}

/// One open connection. Used from a single thread at a time.
pub trait BackendConnection: Send {
    /// Run a statement that returns rows.
    fn query(&mut self, sql: &str) -> Result<RawRows, BackendError>;

    /// Run a statement that does not return rows; returns affected rows.
    fn execute(&mut self, sql: &str) -> Result<u64, BackendError>;

    fn begin(&mut self) -> Result<(), BackendError> {
        self.execute("BEGIN").map(|_| ())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.execute("COMMIT").map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        self.execute("ROLLBACK").map(|_| ())
    }
}

/// Opens connections and describes the catalog of one backend.
pub trait BackendConnector: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError>;

    fn render_create_table(&self, schema: &TableSchema) -> String {
        create_table_sql(self.dialect(), schema)
    }

    /// Query returning one row per user table, table name in the first cell.
    fn list_tables_sql(&self) -> String;

    /// Queries describing one table; their results are handed to
    /// [`parse_table`](Self::parse_table) in the same order.
    fn describe_table_sqls(&self, table: &str) -> Vec<String>;

    /// Rebuild a schema from the results of the describe queries.
    fn parse_table(&self, name: &str, results: Vec<RawRows>) -> Result<TableSchema>;
}
