//! SQLite backend over rusqlite.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode};
use tracing::debug;

use crate::backend::{BackendConnection, BackendConnector, BackendError, RawRows};
use crate::codec::Dialect;
use crate::error::{Error, Result};
use crate::schema::{Column, ColumnType, ForeignKey, TableSchema};
use crate::value::Value;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens connections to one SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Apply connection pragmas.
///
/// - WAL lets readers proceed while a batch commits
/// - NORMAL sync is durable across application crashes in WAL mode
/// - foreign keys are off by default in SQLite
fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

impl BackendConnector for SqliteConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        let conn = Connection::open(&self.path).map_err(map_error)?;
        apply_pragmas(&conn).map_err(map_error)?;
        debug!(path = %self.path.display(), "opened sqlite connection");
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn list_tables_sql(&self) -> String {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            .to_string()
    }

    fn describe_table_sqls(&self, table: &str) -> Vec<String> {
        vec![
            format!("PRAGMA table_info({table})"),
            format!("PRAGMA foreign_key_list({table})"),
            format!("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = '{table}'"),
        ]
    }

    /// `table_info` rows are `(cid, name, type, notnull, dflt_value, pk)`;
    /// `foreign_key_list` rows are
    /// `(id, seq, table, from, to, on_update, on_delete, match)`.
    fn parse_table(&self, name: &str, results: Vec<RawRows>) -> Result<TableSchema> {
        let mut results = results.into_iter();
        let info = results.next().unwrap_or_default();
        let foreign = results.next().unwrap_or_default();
        let ddl = results
            .next()
            .and_then(|rows| rows.into_iter().next())
            .and_then(|row| row.into_iter().next())
            .and_then(|v| v.as_str().map(str::to_ascii_uppercase))
            .unwrap_or_default();

        if info.iter().any(|row| cell_i64(row, 5).is_some_and(|pk| pk > 1)) {
            return Err(Error::invalid_input(
                name,
                "composite primary keys are not supported",
            ));
        }

        let mut columns = Vec::with_capacity(info.len());
        let mut primary_key = None;
        for row in &info {
            let column_name = cell_str(row, 1).ok_or_else(|| {
                Error::invalid_input(name, "table_info returned a column without a name")
            })?;
            let declared = cell_str(row, 2).unwrap_or_default();
            let column_type: ColumnType = declared
                .parse()
                .map_err(|_| Error::invalid_column_type(format!("{name}.{column_name}"), format!("unsupported type `{declared}`")))?;

            let mut modifiers = Vec::new();
            if cell_i64(row, 5).is_some_and(|pk| pk == 1) {
                primary_key = Some(column_name.to_string());
                modifiers.push("PRIMARY KEY");
                if ddl.contains("AUTOINCREMENT") {
                    modifiers.push("AUTOINCREMENT");
                }
            }
            if cell_i64(row, 3).is_some_and(|nn| nn != 0) {
                modifiers.push("NOT NULL");
            }
            columns.push(Column::new(column_name, column_type, modifiers.join(" ")));
        }

        let primary_key = primary_key
            .ok_or_else(|| Error::invalid_input(name, "table has no single-column primary key"))?;

        let foreign_keys = foreign
            .iter()
            .filter_map(|row| {
                let table = cell_str(row, 2)?;
                let from = cell_str(row, 3)?;
                let to = cell_str(row, 4)?;
                let mut modifiers = Vec::new();
                for (clause, idx) in [("ON UPDATE", 5), ("ON DELETE", 6)] {
                    match cell_str(row, idx) {
                        Some(action) if !action.eq_ignore_ascii_case("NO ACTION") => {
                            modifiers.push(format!("{clause} {action}"));
                        }
                        _ => {}
                    }
                }
                Some(ForeignKey::new(from, table, to).with_modifiers(modifiers.join(" ")))
            })
            .collect();

        TableSchema::new(name, columns, primary_key, foreign_keys)
    }
}

fn cell_str(row: &[Value], idx: usize) -> Option<&str> {
    row.get(idx).and_then(Value::as_str)
}

fn cell_i64(row: &[Value], idx: usize) -> Option<i64> {
    row.get(idx).and_then(Value::as_i64)
}

struct SqliteConnection {
    conn: Connection,
}

impl BackendConnection for SqliteConnection {
    fn query(&mut self, sql: &str) -> Result<RawRows, BackendError> {
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(from_sqlite))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(map_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_error)?;
        Ok(rows)
    }

    fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
        let changed = self.conn.execute(sql, []).map_err(map_error)?;
        Ok(changed as u64)
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        self.conn.execute_batch("BEGIN").map_err(map_error)
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.conn.execute_batch("COMMIT").map_err(map_error)
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        self.conn.execute_batch("ROLLBACK").map_err(map_error)
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

/// Classify a rusqlite error. Only failures that make the connection itself
/// unusable are connection-level.
fn map_error(err: rusqlite::Error) -> BackendError {
    let connection_level = match &err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::InternalMalfunction
                | ErrorCode::OutOfMemory
                | ErrorCode::FileLockingProtocolFailed
        ),
        rusqlite::Error::InvalidPath(_) => true,
        _ => false,
    };
    if connection_level {
        BackendError::connection(err.to_string())
    } else {
        BackendError::statement(err.to_string())
    }
}
