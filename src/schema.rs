//! Column and table definitions.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};

/// The five scalar column kinds supported by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int,
    Float,
    Text,
    Bool,
    Blob,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bool => "bool",
            Self::Blob => "blob",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    /// Accepts short names (`int`, `str`) as well as the SQL type names the
    /// backends report (`INTEGER`, `VARCHAR(36)`, `DOUBLE PRECISION`, `tinyint(1)`).
    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        let base = lowered
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let ty = match base {
            "int" | "integer" | "bigint" | "smallint" | "serial" | "bigserial" => Self::Int,
            "float" | "real" | "double" | "numeric" | "decimal" => Self::Float,
            "str" | "text" | "varchar" | "char" | "character" => Self::Text,
            "bool" | "boolean" | "tinyint" => Self::Bool,
            "blob" | "bytes" | "bytea" => Self::Blob,
            _ => {
                return Err(Error::invalid_column_type(
                    s,
                    "supported types are int, float, text, bool, blob",
                ))
            }
        };
        Ok(ty)
    }
}

/// How a text column treats JSON-looking content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextMode {
    /// Strings shaped like a JSON object or array are parsed on read.
    #[default]
    Detect,
    /// Strings are always returned verbatim.
    Plain,
    /// Every non-null value is JSON; unparsable text is returned verbatim.
    Json,
}

/// A declared column. Immutable once its table is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    /// Raw SQL fragments such as `NOT NULL`, `UNIQUE`, `AUTOINCREMENT`.
    pub modifiers: String,
    pub text_mode: TextMode,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType, modifiers: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type,
            modifiers: modifiers.into(),
            text_mode: TextMode::default(),
        }
    }

    #[must_use]
    pub fn with_text_mode(mut self, text_mode: TextMode) -> Self {
        self.text_mode = text_mode;
        self
    }

    pub fn is_not_null(&self) -> bool {
        self.modifiers.to_ascii_uppercase().contains("NOT NULL")
    }

    /// Matches `AUTOINCREMENT`, `AUTO_INCREMENT` and `SERIAL` spellings.
    pub fn is_auto_increment(&self) -> bool {
        let upper = self.modifiers.to_ascii_uppercase();
        upper.contains("INCREMENT") || upper.contains("SERIAL")
    }
}

/// A foreign-key constraint from a local column to `table(reference)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub table: String,
    pub reference: String,
    /// Raw trailing clauses such as `ON DELETE CASCADE`.
    pub modifiers: String,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        table: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            table: table.into(),
            reference: reference.into(),
            modifiers: String::new(),
        }
    }

    #[must_use]
    pub fn with_modifiers(mut self, modifiers: impl Into<String>) -> Self {
        self.modifiers = modifiers.into();
        self
    }
}

/// Validated schema of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    columns: Vec<Column>,
    primary_key: String,
    foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Validate and build a schema.
    ///
    /// Rejects invalid identifiers, duplicate columns, an undeclared primary
    /// key and foreign keys on undeclared columns.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_key: impl Into<String>,
        foreign_keys: Vec<ForeignKey>,
    ) -> Result<Self> {
        let name = name.into();
        let primary_key = primary_key.into();
        validate_identifier(&name)?;
        if columns.is_empty() {
            return Err(Error::invalid_input(&name, "a table needs at least one column"));
        }

        let mut seen = BTreeSet::new();
        for column in &columns {
            validate_identifier(&column.name)?;
            if !seen.insert(column.name.as_str()) {
                return Err(Error::invalid_input(
                    format!("duplicate column name {}", column.name),
                    "column names may only be specified once",
                ));
            }
        }
        if !seen.contains(primary_key.as_str()) {
            return Err(Error::invalid_input(
                &primary_key,
                format!("primary key is not a declared column of {name}"),
            ));
        }
        for fk in &foreign_keys {
            if !seen.contains(fk.column.as_str()) {
                return Err(Error::invalid_input(
                    &fk.column,
                    format!("foreign key column is not declared in {name}"),
                ));
            }
            validate_identifier(&fk.table)?;
            validate_identifier(&fk.reference)?;
        }

        Ok(Self {
            name,
            columns,
            primary_key,
            foreign_keys,
        })
    }

    /// Start building a schema column by column.
    pub fn builder(name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn primary_key_column(&self) -> &Column {
        // Guaranteed by construction.
        self.column(&self.primary_key).unwrap_or(&self.columns[0])
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// For two-column tables, the column that is not the primary key.
    pub fn value_column(&self) -> Option<&Column> {
        if self.columns.len() != 2 {
            return None;
        }
        self.columns.iter().find(|c| c.name != self.primary_key)
    }
}

/// Incremental [`TableSchema`] construction.
#[derive(Debug, Clone)]
pub struct TableSchemaBuilder {
    name: String,
    columns: Vec<Column>,
    primary_key: Option<String>,
    foreign_keys: Vec<ForeignKey>,
}

impl TableSchemaBuilder {
    #[must_use]
    pub fn column(mut self, name: &str, column_type: ColumnType, modifiers: &str) -> Self {
        self.columns.push(Column::new(name, column_type, modifiers));
        self
    }

    #[must_use]
    pub fn primary_key(mut self, name: &str) -> Self {
        self.primary_key = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Validate and build. Without an explicit primary key, a column whose
    /// modifiers mention `PRIMARY KEY` is used.
    pub fn build(self) -> Result<TableSchema> {
        let primary_key = match self.primary_key {
            Some(pk) => pk,
            None => self
                .columns
                .iter()
                .find(|c| c.modifiers.to_ascii_uppercase().contains("PRIMARY KEY"))
                .map(|c| c.name.clone())
                .ok_or_else(|| Error::invalid_input(&self.name, "no primary key declared"))?,
        };
        TableSchema::new(self.name, self.columns, primary_key, self.foreign_keys)
    }
}

/// Read access to the live set of table schemas.
pub trait Catalog {
    fn table(&self, name: &str) -> Option<&TableSchema>;

    fn schemas(&self) -> Box<dyn Iterator<Item = &TableSchema> + '_>;
}

impl Catalog for HashMap<String, TableSchema> {
    fn table(&self, name: &str) -> Option<&TableSchema> {
        self.get(name)
    }

    fn schemas(&self) -> Box<dyn Iterator<Item = &TableSchema> + '_> {
        Box::new(self.values())
    }
}

impl Catalog for HashMap<String, Arc<TableSchema>> {
    fn table(&self, name: &str) -> Option<&TableSchema> {
        self.get(name).map(AsRef::as_ref)
    }

    fn schemas(&self) -> Box<dyn Iterator<Item = &TableSchema> + '_> {
        Box::new(self.values().map(AsRef::as_ref))
    }
}

/// Tables whose foreign keys reference `name`, directly or transitively.
pub fn dependent_tables(catalog: &dyn Catalog, name: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut pending = vec![name.to_string()];
    while let Some(current) = pending.pop() {
        for schema in catalog.schemas() {
            let references = schema.foreign_keys().iter().any(|fk| fk.table == current);
            if references && schema.name() != name && found.insert(schema.name().to_string()) {
                pending.push(schema.name().to_string());
            }
        }
    }
    found
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_input(
            name,
            "identifiers must be alphanumeric or underscore and not start with a digit",
        ))
    }
}
