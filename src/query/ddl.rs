//! CREATE TABLE / DROP TABLE rendering.

use crate::codec::Dialect;
use crate::schema::{Column, ColumnType, TableSchema};

fn sql_type(dialect: Dialect, ty: ColumnType) -> &'static str {
    match (dialect, ty) {
        (Dialect::Sqlite, ColumnType::Int) => "INTEGER",
        (Dialect::Sqlite, ColumnType::Float) => "REAL",
        (Dialect::Mysql, ColumnType::Int) => "INT",
        (Dialect::Mysql, ColumnType::Float) => "DOUBLE",
        (Dialect::Postgres, ColumnType::Int) => "INTEGER",
        (Dialect::Postgres, ColumnType::Float) => "DOUBLE PRECISION",
        (Dialect::Postgres, ColumnType::Blob) => "BYTEA",
        (_, ColumnType::Text) => "TEXT",
        (_, ColumnType::Bool) => "BOOLEAN",
        (_, ColumnType::Blob) => "BLOB",
    }
}

const AUTO_INCREMENT_TOKENS: [&str; 3] = ["AUTOINCREMENT", "AUTO_INCREMENT", "SERIAL"];

/// Primary-key column definition. Text and blob keys become `VARCHAR(36)` so
/// every backend can index them; auto-increment is spelled per dialect.
fn primary_key_definition(dialect: Dialect, column: &Column) -> String {
    let upper = column.modifiers.to_ascii_uppercase().replace("PRIMARY KEY", " ");
    let rest = upper
        .split_whitespace()
        .filter(|token| !AUTO_INCREMENT_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ");
    let auto = column.is_auto_increment() && column.column_type == ColumnType::Int;

    let ty = match column.column_type {
        ColumnType::Text | ColumnType::Blob => "VARCHAR(36)",
        _ if auto && dialect == Dialect::Postgres => "SERIAL",
        other => sql_type(dialect, other),
    };
    let mut parts = vec![column.name.clone(), ty.to_string(), "PRIMARY KEY".to_string()];
    if auto {
        match dialect {
            Dialect::Sqlite => parts.push("AUTOINCREMENT".into()),
            Dialect::Mysql => parts.push("AUTO_INCREMENT".into()),
            Dialect::Postgres => {}
        }
    }
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts.join(" ")
}

fn column_definition(dialect: Dialect, column: &Column) -> String {
    let modifiers = column.modifiers.trim();
    if modifiers.is_empty() {
        format!("{} {}", column.name, sql_type(dialect, column.column_type))
    } else {
        format!("{} {} {modifiers}", column.name, sql_type(dialect, column.column_type))
    }
}

/// Render `CREATE TABLE` for a schema.
pub fn create_table_sql(dialect: Dialect, schema: &TableSchema) -> String {
    let mut definitions: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| {
            if c.name == schema.primary_key() {
                primary_key_definition(dialect, c)
            } else {
                column_definition(dialect, c)
            }
        })
        .collect();
    for fk in schema.foreign_keys() {
        let mut constraint = format!(
            "FOREIGN KEY({}) REFERENCES {}({})",
            fk.column, fk.table, fk.reference
        );
        let modifiers = fk.modifiers.trim();
        if !modifiers.is_empty() {
            constraint.push(' ');
            constraint.push_str(modifiers);
        }
        definitions.push(constraint);
    }
    format!("CREATE TABLE {} ({})", schema.name(), definitions.join(", "))
}

pub fn drop_table_sql(name: &str) -> String {
    format!("DROP TABLE {name}")
}
