//! Rowgate: dictionary-style relational tables behind a single-writer commit queue.
//!
//! Tables are exposed as typed, dictionary-like objects with select, insert,
//! update and delete. Every statement flows through one background consumer
//! that owns the backend connection, executes reads immediately and groups
//! writes into short commit batches. Rows fetched by primary key are kept in
//! a bounded per-table LRU cache that is kept consistent with every mutation.
//!
//! # Architecture
//!
//! - **Single writer**: one consumer thread per database owns the connection
//! - **Group commit**: writes are flushed when the queue drains, when the
//!   batching window elapses, or right before a read
//! - **Self-healing**: connection-level failures restart the consumer on a
//!   fresh connection without losing queued requests
//! - **Cached**: per-table row cache and a database-wide statement cache
//!
//! # Modules
//!
//! - [`backend`]: Connector traits and the SQLite implementation
//! - [`cache`]: Bounded LRU cache and the statement-result cache
//! - [`codec`]: Value coercion, literal rendering and decoding per dialect
//! - [`config`]: CLI and environment configuration
//! - [`database`]: Table registry and engine orchestration
//! - [`engine`]: Query queue, commit batching and liveness probe
//! - [`observability`]: Tracing setup
//! - [`query`]: SQL statement builders
//! - [`schema`]: Column and table definitions
//! - [`table`]: Dictionary-style table operations
//! - [`value`]: Typed cell values and rows

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // query::QueryError style names are fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // col/cols/column are fine
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod observability;
pub mod query;
pub mod schema;
pub mod table;
pub mod value;

pub use config::{BackendKind, Config};
pub use database::Database;
pub use error::{Error, Result};
pub use query::{Condition, Join, Operand, Operator, OrderBy, Select, Where};
pub use schema::{Column, ColumnType, ForeignKey, TableSchema, TextMode};
pub use table::{Item, Table};
pub use value::{Row, RowKey, Value};

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) query ID.
///
/// # Example
///
/// ```
/// let id = rowgate::generate_query_id();
/// assert_eq!(id.to_string().len(), 36);
/// ```
#[must_use]
pub fn generate_query_id() -> Uuid {
    Uuid::now_v7()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
