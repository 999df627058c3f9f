//! WHERE trees.
//!
//! A [`Where`] is either a flat column/value map (every pair joined with
//! `AND` as an equality test) or a list of [`Condition`]s. Literals are
//! coerced against the column on the left side before they are rendered.

use std::fmt;
use std::str::FromStr;

use crate::codec::{self, Dialect};
use crate::error::{Error, Result};
use crate::schema::{Catalog, Column, TableSchema};
use crate::value::Value;

/// A filter attached to select, update and delete.
#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    /// `col = value AND col = value ...`
    Map(Vec<(String, Value)>),
    /// Conditions joined with `AND`.
    Conditions(Vec<Condition>),
}

impl Where {
    /// Single equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Map(vec![(column.into(), value.into())])
    }

    /// Add another equality to the filter.
    #[must_use]
    pub fn and(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        match self {
            Self::Map(mut pairs) => {
                pairs.push((column.into(), value.into()));
                Self::Map(pairs)
            }
            Self::Conditions(mut conditions) => {
                conditions.push(Condition::Map(vec![(column.into(), value.into())]));
                Self::Conditions(conditions)
            }
        }
    }

    /// Add a comparison to the filter.
    #[must_use]
    pub fn and_condition(self, condition: Condition) -> Self {
        match self {
            Self::Map(pairs) if pairs.is_empty() => Self::Conditions(vec![condition]),
            Self::Map(pairs) => Self::Conditions(vec![Condition::Map(pairs), condition]),
            Self::Conditions(mut conditions) => {
                conditions.push(condition);
                Self::Conditions(conditions)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Map(pairs) => pairs.is_empty(),
            Self::Conditions(conditions) => conditions.iter().all(Condition::is_empty),
        }
    }

    /// The flat pairs, when this filter is a plain equality map.
    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Self::Map(pairs) => Some(pairs),
            Self::Conditions(_) => None,
        }
    }

    /// Columns referenced on the left side of any condition.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::Map(pairs) => pairs.iter().map(|(c, _)| c.as_str()).collect(),
            Self::Conditions(conditions) => conditions
                .iter()
                .flat_map(|c| match c {
                    Condition::Map(pairs) => {
                        pairs.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>()
                    }
                    Condition::Compare { left, .. } => vec![left.as_str()],
                })
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Where {
    fn from(pairs: [(K, V); N]) -> Self {
        Self::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<Vec<Condition>> for Where {
    fn from(conditions: Vec<Condition>) -> Self {
        Self::Conditions(conditions)
    }
}

/// One entry of a condition list.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Map(Vec<(String, Value)>),
    Compare {
        left: String,
        op: Operator,
        right: Operand,
    },
}

impl Condition {
    /// Parse the operator from text, rejecting unknown operators.
    pub fn new(left: impl Into<String>, op: &str, right: impl Into<Operand>) -> Result<Self> {
        Ok(Self::Compare {
            left: left.into(),
            op: op.parse()?,
            right: right.into(),
        })
    }

    pub fn compare(left: impl Into<String>, op: Operator, right: impl Into<Operand>) -> Self {
        Self::Compare {
            left: left.into(),
            op,
            right: right.into(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Map(pairs) if pairs.is_empty())
    }
}

/// Comparison operators accepted in condition lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    DoubleEq,
    Ne,
    BangEq,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    In,
    NotIn,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq | Self::DoubleEq => "=",
            Self::Ne => "<>",
            Self::BangEq => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
        }
    }

    fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::DoubleEq)
    }

    fn is_inequality(self) -> bool {
        matches!(self, Self::Ne | Self::BangEq)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        let op = match normalized.as_str() {
            "=" => Self::Eq,
            "==" => Self::DoubleEq,
            "<>" => Self::Ne,
            "!=" => Self::BangEq,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            "like" => Self::Like,
            "not like" => Self::NotLike,
            "in" => Self::In,
            "not in" => Self::NotIn,
            _ => {
                return Err(Error::invalid_input(
                    s,
                    "supported operators are =, ==, <>, !=, >, >=, <, <=, like, not like, in, not in",
                ))
            }
        };
        Ok(op)
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    /// A `table.column` or local column reference, rendered unquoted.
    Column(String),
    /// Values for `in` / `not in`.
    List(Vec<Value>),
}

impl Operand {
    pub fn column(reference: impl Into<String>) -> Self {
        Self::Column(reference.into())
    }

    pub fn list<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

macro_rules! operand_from_scalar {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Operand {
            fn from(v: $ty) -> Self {
                Self::Value(v.into())
            }
        })*
    };
}

operand_from_scalar!(i64, i32, f64, bool, &str, String);

impl From<Vec<Value>> for Operand {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

macro_rules! operand_from_list {
    ($($ty:ty),*) => {
        $(impl From<Vec<$ty>> for Operand {
            fn from(v: Vec<$ty>) -> Self {
                Self::list(v)
            }
        })*
    };
}

operand_from_list!(i64, i32, f64, &str, String);

/// Tables visible to one statement, used to resolve column references.
pub(crate) struct Scope<'a> {
    pub(crate) dialect: Dialect,
    pub(crate) base: &'a TableSchema,
    pub(crate) tables: Vec<&'a TableSchema>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(dialect: Dialect, base: &'a TableSchema) -> Self {
        Self {
            dialect,
            base,
            tables: vec![base],
        }
    }

    /// Add a joined table, looked up in the catalog.
    pub(crate) fn join(&mut self, catalog: &'a dyn Catalog, name: &str) -> Result<&'a TableSchema> {
        let schema = catalog
            .table(name)
            .ok_or_else(|| Error::invalid_input(name, "table does not exist"))?;
        if !self.tables.iter().any(|t| t.name() == name) {
            self.tables.push(schema);
        }
        Ok(schema)
    }

    fn table(&self, name: &str) -> Option<&'a TableSchema> {
        self.tables.iter().copied().find(|t| t.name() == name)
    }

    /// Resolve `column` or `table.column` against the tables in scope.
    pub(crate) fn resolve(&self, reference: &str) -> Result<&'a Column> {
        match reference.split_once('.') {
            Some((table, column)) => {
                let schema = self.table(table).ok_or_else(|| {
                    Error::invalid_input(reference, format!("table {table} is not part of this statement"))
                })?;
                schema.column(column).ok_or_else(|| {
                    Error::invalid_column_type(reference, format!("{table} has no column {column}"))
                })
            }
            None => self.base.column(reference).ok_or_else(|| {
                Error::invalid_input(
                    reference,
                    format!("{} has no column {reference}", self.base.name()),
                )
            }),
        }
    }

    /// A text value naming a `table.column` in scope is treated as a
    /// column reference.
    fn as_column_reference(&self, value: &Value) -> Option<String> {
        let text = value.as_str()?;
        let (table, column) = text.split_once('.')?;
        self.table(table)?.column(column)?;
        Some(text.to_string())
    }

    fn literal(&self, reference: &str, column: &Column, value: Value) -> Result<String> {
        let coerced = codec::coerce(column, value)
            .map_err(|e| Error::invalid_input(reference, e.to_string()))?;
        Ok(self.dialect.literal(&coerced))
    }
}

/// Render a filter. Returns an empty string for an empty filter, otherwise
/// a clause starting with `WHERE`.
pub(crate) fn render_where(scope: &Scope<'_>, filter: &Where) -> Result<String> {
    let mut parts = Vec::new();
    match filter {
        Where::Map(pairs) => render_pairs(scope, pairs, &mut parts)?,
        Where::Conditions(conditions) => {
            for condition in conditions {
                match condition {
                    Condition::Map(pairs) => render_pairs(scope, pairs, &mut parts)?,
                    Condition::Compare { left, op, right } => {
                        parts.push(render_compare(scope, left, *op, right)?);
                    }
                }
            }
        }
    }
    if parts.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!("WHERE {}", parts.join(" AND ")))
    }
}

fn render_pairs(scope: &Scope<'_>, pairs: &[(String, Value)], out: &mut Vec<String>) -> Result<()> {
    for (reference, value) in pairs {
        let column = scope.resolve(reference)?;
        if value.is_null() {
            out.push(format!("{reference} IS NULL"));
        } else {
            out.push(format!("{reference} = {}", scope.literal(reference, column, value.clone())?));
        }
    }
    Ok(())
}

fn render_compare(scope: &Scope<'_>, left: &str, op: Operator, right: &Operand) -> Result<String> {
    let column = scope.resolve(left)?;
    match op {
        Operator::In | Operator::NotIn => {
            let Operand::List(values) = right else {
                return Err(Error::invalid_input(
                    left,
                    format!("'{}' should be followed by a list", op.as_sql().to_ascii_lowercase()),
                ));
            };
            if values.is_empty() {
                // An empty set matches nothing, its complement everything.
                return Ok(if op == Operator::In { "1 = 0" } else { "1 = 1" }.to_string());
            }
            let literals = values
                .iter()
                .map(|v| scope.literal(left, column, v.clone()))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("{left} {op} ({})", literals.join(", ")))
        }
        Operator::Like | Operator::NotLike => match right {
            Operand::Column(reference) => {
                scope.resolve(reference)?;
                Ok(format!("{left} {op} {reference}"))
            }
            Operand::Value(value) if !value.is_null() => {
                let text = value.to_string();
                let pattern = if text.contains('*') {
                    text.replace('*', "%")
                } else {
                    format!("%{text}%")
                };
                Ok(format!("{left} {op} {}", scope.dialect.quote(&pattern)))
            }
            _ => Err(Error::invalid_input(left, "like expects a text pattern")),
        },
        _ => match right {
            Operand::Column(reference) => {
                scope.resolve(reference)?;
                Ok(format!("{left} {op} {reference}"))
            }
            Operand::List(_) => Err(Error::invalid_input(
                left,
                format!("a list is only valid with in / not in, not {op}"),
            )),
            Operand::Value(value) => {
                if let Some(reference) = scope.as_column_reference(value) {
                    return Ok(format!("{left} {op} {reference}"));
                }
                if value.is_null() {
                    return if op.is_equality() {
                        Ok(format!("{left} IS NULL"))
                    } else if op.is_inequality() {
                        Ok(format!("{left} IS NOT NULL"))
                    } else {
                        Err(Error::invalid_input(left, format!("NULL cannot be compared with {op}")))
                    };
                }
                Ok(format!("{left} {op} {}", scope.literal(left, column, value.clone())?))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn stocks() -> TableSchema {
        TableSchema::builder("stocks")
            .column("order_num", ColumnType::Int, "AUTOINCREMENT")
            .column("symbol", ColumnType::Text, "")
            .column("qty", ColumnType::Float, "")
            .column("active", ColumnType::Bool, "")
            .primary_key("order_num")
            .build()
            .unwrap()
    }

    fn render(filter: &Where) -> Result<String> {
        let schema = stocks();
        let scope = Scope::new(Dialect::Sqlite, &schema);
        render_where(&scope, filter)
    }

    #[test]
    fn test_map_renders_equalities() {
        let sql = render(&Where::eq("symbol", "RHAT").and("qty", 100)).unwrap();
        assert_eq!(sql, "WHERE symbol = 'RHAT' AND qty = 100.0");
        assert_eq!(render(&Where::eq("symbol", Value::Null)).unwrap(), "WHERE symbol IS NULL");
        assert_eq!(render(&Where::Map(Vec::new())).unwrap(), "");
    }

    #[test]
    fn test_conditions() {
        let filter = Where::from(vec![
            Condition::new("qty", ">", 10).unwrap(),
            Condition::new("symbol", "NOT  IN", vec!["A", "B"]).unwrap(),
            Condition::new("active", "=", true).unwrap(),
        ]);
        assert_eq!(
            render(&filter).unwrap(),
            "WHERE qty > 10.0 AND symbol NOT IN ('A', 'B') AND active = 1"
        );
    }

    #[test]
    fn test_like_wildcards() {
        let contains = Where::from(vec![Condition::new("symbol", "like", "HA").unwrap()]);
        assert_eq!(render(&contains).unwrap(), "WHERE symbol LIKE '%HA%'");
        let prefix = Where::from(vec![Condition::new("symbol", "like", "RH*").unwrap()]);
        assert_eq!(render(&prefix).unwrap(), "WHERE symbol LIKE 'RH%'");
    }

    #[test]
    fn test_in_requires_list() {
        let filter = Where::from(vec![Condition::new("symbol", "in", "RHAT").unwrap()]);
        assert!(matches!(render(&filter), Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_unknown_operator_and_column() {
        assert!(Condition::new("qty", "~=", 1).is_err());
        assert!(matches!(
            render(&Where::eq("missing", 1)),
            Err(Error::InvalidInput { .. })
        ));
        assert!(render(&Where::eq("other.qty", 1)).is_err());
    }

    #[test]
    fn test_unconvertible_where_value_is_rejected() {
        let err = render(&Where::eq("qty", "lots")).unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_null_comparisons() {
        let ne = Where::from(vec![Condition::new("symbol", "!=", Value::Null).unwrap()]);
        assert_eq!(render(&ne).unwrap(), "WHERE symbol IS NOT NULL");
        let gt = Where::from(vec![Condition::new("qty", ">", Value::Null).unwrap()]);
        assert!(render(&gt).is_err());
    }

    #[test]
    fn test_qualified_column_operand() {
        let filter = Where::from(vec![Condition::new("stocks.qty", ">=", "stocks.order_num").unwrap()]);
        assert_eq!(render(&filter).unwrap(), "WHERE stocks.qty >= stocks.order_num");
    }

    #[test]
    fn test_and_condition_promotes_map() {
        let filter = Where::eq("symbol", "A").and_condition(Condition::compare("qty", Operator::Lt, 5));
        assert!(filter.as_map().is_none());
        assert_eq!(filter.columns(), vec!["symbol", "qty"]);
        assert_eq!(render(&filter).unwrap(), "WHERE symbol = 'A' AND qty < 5.0");
    }
}
