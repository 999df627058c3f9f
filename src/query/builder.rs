//! SELECT / INSERT / UPDATE / DELETE construction.

use std::collections::BTreeSet;

use tracing::warn;

use crate::backend::RawRows;
use crate::codec::{self, Dialect};
use crate::error::{Error, Result};
use crate::query::filter::{render_where, Scope, Where};
use crate::query::join::{self, Join, JoinClause};
use crate::query::Statement;
use crate::schema::{Catalog, Column, TableSchema};
use crate::value::{Row, Value};

/// Which columns a select returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    /// Every column. With a join, every column of every joined table keyed
    /// as `table.column`, minus the duplicated side of each join pair.
    #[default]
    All,
    /// Explicit `column` or `table.column` references, returned under the
    /// name given.
    Columns(Vec<String>),
}

/// Sort order for a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

impl From<&str> for OrderBy {
    fn from(column: &str) -> Self {
        Self::asc(column)
    }
}

/// A select request against one table.
///
/// ```
/// use rowgate::{Join, Select, Where};
///
/// let request = Select::columns(["employees.name", "positions.name"])
///     .join(Join::foreign_key("positions"))
///     .filter(Where::eq("employees.id", 1))
///     .order_by("employees.name");
/// assert!(request.join.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    pub selection: Selection,
    pub filter: Option<Where>,
    pub join: Option<Join>,
    pub order_by: Option<OrderBy>,
}

impl Select {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn columns<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            selection: Selection::Columns(columns.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: impl Into<Where>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn join(mut self, join: Join) -> Self {
        self.join = Some(join);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: impl Into<OrderBy>) -> Self {
        self.order_by = Some(order.into());
        self
    }
}

/// One column of a select's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    /// Name under which the value appears in each result row.
    pub key: String,
    /// Declared column, used to decode backend values.
    pub column: Column,
}

/// A rendered select plus what is needed to decode its results.
#[derive(Debug, Clone)]
pub struct SelectPlan {
    pub statement: Statement,
    pub columns: Vec<OutputColumn>,
    /// True for `SELECT *` with no join, whose rows are whole table rows.
    pub whole_rows: bool,
}

impl SelectPlan {
    /// Decode raw backend rows into keyed, typed rows.
    pub fn decode(&self, rows: RawRows) -> Result<Vec<Row>> {
        rows.into_iter()
            .map(|raw| {
                if raw.len() != self.columns.len() {
                    return Err(Error::Statement {
                        table: self.statement.primary_table().to_string(),
                        sql: self.statement.sql.clone(),
                        message: format!(
                            "expected {} columns, backend returned {}",
                            self.columns.len(),
                            raw.len()
                        ),
                    });
                }
                Ok(self
                    .columns
                    .iter()
                    .zip(raw)
                    .map(|(out, value)| (out.key.clone(), codec::decode(&out.column, value)))
                    .collect())
            })
            .collect()
    }
}

/// Render a select against `base`.
pub fn build_select(
    catalog: &dyn Catalog,
    dialect: Dialect,
    base: &TableSchema,
    request: &Select,
) -> Result<SelectPlan> {
    let mut scope = Scope::new(dialect, base);
    let clauses = match &request.join {
        Some(join) => join::resolve(catalog, &mut scope, join)?,
        None => Vec::new(),
    };

    let (projection, columns) = match &request.selection {
        Selection::All if clauses.is_empty() => {
            let columns = base
                .columns()
                .iter()
                .map(|c| OutputColumn {
                    key: c.name.clone(),
                    column: c.clone(),
                })
                .collect();
            ("*".to_string(), columns)
        }
        Selection::All => {
            let columns = joined_columns(&scope, &clauses);
            let projection = columns.iter().map(|c| c.key.as_str()).collect::<Vec<_>>().join(", ");
            (projection, columns)
        }
        Selection::Columns(names) => {
            if names.is_empty() {
                return Err(Error::invalid_input(base.name(), "no columns selected"));
            }
            let columns = names
                .iter()
                .map(|name| {
                    scope.resolve(name).map(|column| OutputColumn {
                        key: name.clone(),
                        column: column.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            (names.join(", "), columns)
        }
    };

    let mut parts = vec![format!("SELECT {projection} FROM {}", base.name())];
    parts.extend(clauses.iter().map(JoinClause::render));
    if let Some(filter) = &request.filter {
        let clause = render_where(&scope, filter)?;
        if !clause.is_empty() {
            parts.push(clause);
        }
    }
    if let Some(order) = &request.order_by {
        scope.resolve(&order.column)?;
        let direction = if order.descending { " DESC" } else { "" };
        parts.push(format!("ORDER BY {}{direction}", order.column));
    }

    let tables: BTreeSet<String> = scope.tables.iter().map(|t| t.name().to_string()).collect();
    Ok(SelectPlan {
        statement: Statement::read(parts.join(" "), tables),
        columns,
        whole_rows: clauses.is_empty() && request.selection == Selection::All,
    })
}

fn joined_columns(scope: &Scope<'_>, clauses: &[JoinClause]) -> Vec<OutputColumn> {
    let mut columns = Vec::new();
    for table in &scope.tables {
        let clause = clauses.iter().find(|c| c.table == table.name());
        for column in table.columns() {
            let key = format!("{}.{}", table.name(), column.name);
            if clause.is_some_and(|c| c.is_redundant(&key)) {
                continue;
            }
            columns.push(OutputColumn {
                key,
                column: column.clone(),
            });
        }
    }
    columns
}

/// A rendered insert and the coerced row it writes.
#[derive(Debug, Clone)]
pub struct InsertPlan {
    pub statement: Statement,
    pub row: Row,
}

impl InsertPlan {
    /// True when every declared column was supplied with a usable key, so the
    /// written row is exactly what a later read would return.
    pub fn is_complete(&self, schema: &TableSchema) -> bool {
        schema.column_names().all(|c| self.row.contains_key(c))
            && self.row.get(schema.primary_key()).is_some_and(|v| !v.is_null())
    }
}

/// Render an insert. Values that cannot be represented in their column are
/// dropped with a warning; a NOT NULL column left without a value is an
/// error unless the backend assigns it.
pub fn build_insert(
    dialect: Dialect,
    schema: &TableSchema,
    values: Vec<(String, Value)>,
) -> Result<InsertPlan> {
    let row = accept_values(schema, values, "insert")?;
    for column in schema.columns() {
        if !row.contains_key(&column.name) && column.is_not_null() && !column.is_auto_increment() {
            return Err(Error::invalid_input(
                &column.name,
                format!("{} is a required field for INSERT into {}", column.name, schema.name()),
            ));
        }
    }
    if row.is_empty() {
        return Err(Error::invalid_input(schema.name(), "no values to insert"));
    }

    let (names, literals): (Vec<&str>, Vec<String>) = schema
        .columns()
        .iter()
        .filter_map(|c| row.get(&c.name).map(|v| (c.name.as_str(), dialect.literal(v))))
        .unzip();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        schema.name(),
        names.join(", "),
        literals.join(", ")
    );
    Ok(InsertPlan {
        statement: Statement::write(sql, single(schema)),
        row,
    })
}

/// A rendered update and the coerced column changes it applies.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub statement: Statement,
    pub changes: Row,
}

pub fn build_update(
    dialect: Dialect,
    schema: &TableSchema,
    set: Vec<(String, Value)>,
    filter: Option<&Where>,
) -> Result<UpdatePlan> {
    let changes = accept_values(schema, set, "update")?;
    if changes.is_empty() {
        return Err(Error::invalid_input(schema.name(), "nothing to update"));
    }
    let assignments = schema
        .columns()
        .iter()
        .filter_map(|c| changes.get(&c.name).map(|v| format!("{} = {}", c.name, dialect.literal(v))))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("UPDATE {} SET {assignments}", schema.name());
    if let Some(filter) = filter {
        let clause = render_where(&Scope::new(dialect, schema), filter)?;
        if !clause.is_empty() {
            sql.push(' ');
            sql.push_str(&clause);
        }
    }
    Ok(UpdatePlan {
        statement: Statement::write(sql, single(schema)),
        changes,
    })
}

/// Render a delete. Deleting without a filter requires `all_rows`.
pub fn build_delete(
    dialect: Dialect,
    schema: &TableSchema,
    filter: Option<&Where>,
    all_rows: bool,
) -> Result<Statement> {
    let clause = match filter {
        Some(filter) => render_where(&Scope::new(dialect, schema), filter)?,
        None => String::new(),
    };
    if clause.is_empty() && !all_rows {
        return Err(Error::invalid_input(
            schema.name(),
            "delete without a filter requires all_rows",
        ));
    }
    let sql = if clause.is_empty() {
        format!("DELETE FROM {}", schema.name())
    } else {
        format!("DELETE FROM {} {clause}", schema.name())
    };
    Ok(Statement::write(sql, single(schema)))
}

fn accept_values(schema: &TableSchema, values: Vec<(String, Value)>, action: &str) -> Result<Row> {
    let mut row = Row::new();
    for (name, value) in values {
        let column = schema.column(&name).ok_or_else(|| {
            Error::invalid_input(&name, format!("{} has no column {name}", schema.name()))
        })?;
        match codec::coerce(column, value) {
            Ok(coerced) => {
                row.insert(name, coerced);
            }
            Err(e) => {
                warn!(table = schema.name(), action, error = %e, "dropping unsupported value");
            }
        }
    }
    Ok(row)
}

fn single(schema: &TableSchema) -> BTreeSet<String> {
    BTreeSet::from([schema.name().to_string()])
}
