//! Stateless SQL statement builders.
//!
//! Every builder validates table and column references against a
//! [`Catalog`](crate::schema::Catalog) before emitting SQL, so unknown names
//! are rejected up front instead of failing inside the backend.
//!
//! - [`filter`]: WHERE trees
//! - [`join`]: JOIN clauses and foreign-key resolution
//! - [`builder`]: SELECT / INSERT / UPDATE / DELETE
//! - [`ddl`]: CREATE TABLE / DROP TABLE per dialect

pub mod builder;
pub mod ddl;
pub mod filter;
pub mod join;

pub use builder::{
    build_delete, build_insert, build_select, build_update, InsertPlan, OrderBy, OutputColumn,
    Select, SelectPlan, Selection, UpdatePlan,
};
pub use ddl::{create_table_sql, drop_table_sql};
pub use filter::{Condition, Operand, Operator, Where};
pub use join::Join;

use std::collections::BTreeSet;

/// Whether a statement only reads or also writes.
///
/// The engine uses this tag to decide between executing immediately and
/// joining the pending commit batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

/// Rendered SQL plus the metadata the engine needs to route and cache it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub kind: StatementKind,
    /// Tables the statement touches. Empty for caller-supplied raw SQL.
    pub tables: BTreeSet<String>,
}

impl Statement {
    pub fn read(sql: impl Into<String>, tables: BTreeSet<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: StatementKind::Read,
            tables,
        }
    }

    pub fn write(sql: impl Into<String>, tables: BTreeSet<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: StatementKind::Write,
            tables,
        }
    }

    pub fn is_read(&self) -> bool {
        self.kind == StatementKind::Read
    }

    /// First table touched, used to label errors.
    pub fn primary_table(&self) -> &str {
        self.tables.iter().next().map_or("", String::as_str)
    }
}
