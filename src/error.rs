//! Error taxonomy shared by every layer of the crate.

use thiserror::Error;

use crate::backend::BackendError;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to callers of [`Database`](crate::Database) and
/// [`Table`](crate::Table).
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unknown reference in caller input. Raised before any SQL
    /// is issued.
    #[error("invalid input `{input}`: {message}")]
    InvalidInput { input: String, message: String },

    /// A column declared with an unsupported type, or a column whose type
    /// cannot be resolved.
    #[error("invalid column type `{column}`: {message}")]
    InvalidColumnType { column: String, message: String },

    /// The backend rejected one specific statement.
    #[error("statement failed on `{table}`: {message} (sql: {sql})")]
    Statement {
        table: String,
        sql: String,
        message: String,
    },

    /// The request was in flight when the connection was lost.
    #[error("request lost: connection failed before completion")]
    RequestLost,

    /// The database is closing or closed.
    #[error("database is shutting down")]
    ShuttingDown,

    /// The engine exhausted its restart budget and no longer serves requests.
    #[error("engine failed: {0}")]
    EngineFailed(String),

    /// The backend could not be reached while opening the database.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl Error {
    pub(crate) fn invalid_input(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            input: input.into(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_column_type(
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidColumnType {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Attach the originating table name to a statement failure.
    pub(crate) fn with_table(self, name: &str) -> Self {
        match self {
            Self::Statement { sql, message, .. } => Self::Statement {
                table: name.to_string(),
                sql,
                message,
            },
            other => other,
        }
    }

    /// Returns true for errors raised before anything reached the backend.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::InvalidColumnType { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_table_only_touches_statement_errors() {
        let err = Error::Statement {
            table: String::new(),
            sql: "SELECT 1".into(),
            message: "boom".into(),
        }
        .with_table("stocks");
        assert!(err.to_string().contains("`stocks`"));

        let err = Error::invalid_input("x", "bad").with_table("stocks");
        assert!(err.is_input_error());
        assert!(!err.to_string().contains("stocks"));
    }
}
