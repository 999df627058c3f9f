//! JOIN clauses.

use crate::error::{Error, Result};
use crate::query::filter::Scope;
use crate::schema::{Catalog, TableSchema};

/// Tables joined onto a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Join {
    /// Explicit `table -> [(left, right)]` column pairs, each side written as
    /// `table.column`. A table with no pairs is joined through its foreign
    /// key, as with [`Join::ForeignKey`].
    On(Vec<(String, Vec<(String, String)>)>),
    /// Join a single table through the one foreign key linking it to the
    /// selected table.
    ForeignKey(String),
}

impl Join {
    pub fn on(table: impl Into<String>, left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::On(vec![(table.into(), vec![(left.into(), right.into())])])
    }

    /// Add a column pair, grouping it with earlier pairs for the same table.
    ///
    /// A foreign key join keeps its table and gains the new pair alongside.
    /// Adding a pair for that same table replaces the foreign key link with
    /// the explicit pair.
    #[must_use]
    pub fn and_on(
        self,
        table: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> Self {
        let table = table.into();
        let pair = (left.into(), right.into());
        let mut groups = match self {
            Self::On(groups) => groups,
            Self::ForeignKey(name) => vec![(name, Vec::new())],
        };
        match groups.iter_mut().find(|(name, _)| *name == table) {
            Some((_, pairs)) => pairs.push(pair),
            None => groups.push((table, vec![pair])),
        }
        Self::On(groups)
    }

    pub fn foreign_key(table: impl Into<String>) -> Self {
        Self::ForeignKey(table.into())
    }
}

/// A validated `JOIN table ON ...` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoinClause {
    pub(crate) table: String,
    pub(crate) pairs: Vec<(String, String)>,
}

impl JoinClause {
    pub(crate) fn render(&self) -> String {
        let on = self
            .pairs
            .iter()
            .map(|(l, r)| format!("{l} = {r}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!("JOIN {} ON {on}", self.table)
    }

    /// Whether `reference` is the joined-table side of one of the pairs, in
    /// which case it duplicates a column already selected from the other side.
    pub(crate) fn is_redundant(&self, reference: &str) -> bool {
        let own = |side: &str| side.split_once('.').is_some_and(|(t, _)| t == self.table);
        self.pairs.iter().any(|(left, right)| {
            if own(right) {
                right == reference
            } else {
                own(left) && left == reference
            }
        })
    }
}

/// Validate a join against the catalog and add the joined tables to `scope`.
pub(crate) fn resolve<'a>(
    catalog: &'a dyn Catalog,
    scope: &mut Scope<'a>,
    join: &Join,
) -> Result<Vec<JoinClause>> {
    match join {
        Join::ForeignKey(table) => {
            let joined = scope.join(catalog, table)?;
            Ok(vec![foreign_key_clause(scope.base, joined)?])
        }
        Join::On(groups) => {
            let mut joined = Vec::with_capacity(groups.len());
            for (table, _) in groups {
                joined.push(scope.join(catalog, table)?);
            }
            let mut clauses = Vec::with_capacity(groups.len());
            for ((table, pairs), schema) in groups.iter().zip(joined) {
                if pairs.is_empty() {
                    clauses.push(foreign_key_clause(scope.base, schema)?);
                    continue;
                }
                for (left, right) in pairs {
                    for side in [left, right] {
                        if !side.contains('.') {
                            return Err(Error::invalid_input(
                                side,
                                "join columns must be written as table.column",
                            ));
                        }
                        scope.resolve(side)?;
                    }
                }
                clauses.push(JoinClause {
                    table: table.clone(),
                    pairs: pairs.clone(),
                });
            }
            Ok(clauses)
        }
    }
}

/// The clause joining `joined` through the single foreign key linking it to
/// `base`, in either direction.
fn foreign_key_clause(base: &TableSchema, joined: &TableSchema) -> Result<JoinClause> {
    let table = joined.name();
    let mut pairs: Vec<(String, String)> = base
        .foreign_keys()
        .iter()
        .filter(|fk| fk.table == table)
        .map(|fk| {
            (
                format!("{}.{}", base.name(), fk.column),
                format!("{table}.{}", fk.reference),
            )
        })
        .collect();
    pairs.extend(
        joined
            .foreign_keys()
            .iter()
            .filter(|fk| fk.table == base.name())
            .map(|fk| {
                (
                    format!("{}.{}", base.name(), fk.reference),
                    format!("{table}.{}", fk.column),
                )
            }),
    );
    match pairs.len() {
        1 => Ok(JoinClause {
            table: table.to_string(),
            pairs,
        }),
        0 => Err(Error::invalid_input(
            table,
            format!("{} and {table} share no foreign key", base.name()),
        )),
        _ => Err(Error::invalid_input(
            table,
            "more than one foreign key links these tables, name the columns explicitly",
        )),
    }
}
