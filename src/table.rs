//! Dictionary-style table operations with a write-through row cache.
//!
//! Each table caches whole rows keyed by primary key. Rows enter the cache
//! from complete inserts and from `SELECT *` results; updates and deletes
//! patch or drop the cached rows they match.
//!
//! Cache effects must follow commit order even though the tasks that issued
//! a batch of writes wake in any order. Every write takes a ticket by bumping
//! a per-table epoch before it is submitted, and bumps it again when it
//! applies its effects after completion:
//!
//! - a write patches cached rows only if no other write or clear happened on
//!   the table since its ticket; otherwise it drops the rows it touched
//! - a select stores its results only if the epoch it observed before
//!   submitting is still current
//!
//! Epoch changes and cache mutation happen under the cache lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio_stream::Stream;
use tracing::{debug, error, trace};

use crate::cache::LruCache;
use crate::codec::{self, Dialect};
use crate::database::DatabaseInner;
use crate::error::{Error, Result};
use crate::query::{build_delete, build_insert, build_select, build_update, Select, Selection, Statement, Where};
use crate::schema::{dependent_tables, Catalog, TableSchema};
use crate::value::{Row, RowKey, Value};

type RowCache = LruCache<RowKey, Row>;

/// What `get` returns and `set` accepts.
///
/// Two-column tables use [`Item::Value`] for the non-key column; wider tables
/// use [`Item::Row`].
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Value(Value),
    Row(Row),
}

/// One table of a [`Database`](crate::Database).
pub struct Table {
    schema: Arc<TableSchema>,
    db: Weak<DatabaseInner>,
    cache: Mutex<Option<RowCache>>,
    epoch: AtomicU64,
    max_entries: usize,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.schema.name())
            .field("cached_rows", &self.cached_rows())
            .finish_non_exhaustive()
    }
}

/// Which cached rows a filter selects.
enum Matcher {
    /// Primary-key lookup plus the remaining equalities.
    Key(RowKey, Vec<(String, Value)>),
    /// Linear scan over every cached row.
    Scan(Vec<(String, Value)>),
    /// No filter at all.
    All,
    /// Not evaluable in memory.
    Unknown,
}

impl Table {
    pub(crate) fn new(
        schema: TableSchema,
        db: Weak<DatabaseInner>,
        cache_enabled: bool,
        max_entries: usize,
    ) -> Self {
        Self {
            schema: Arc::new(schema),
            db,
            cache: Mutex::new(cache_enabled.then(|| LruCache::new(max_entries))),
            epoch: AtomicU64::new(0),
            max_entries,
        }
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.lock_cache().is_some()
    }

    /// Number of rows currently cached.
    pub fn cached_rows(&self) -> usize {
        self.lock_cache().as_ref().map_or(0, LruCache::len)
    }

    pub fn enable_cache(&self) {
        let mut cache = self.lock_cache();
        if cache.is_some() {
            error!(table = self.name(), "cache already enabled");
            return;
        }
        *cache = Some(LruCache::new(self.max_entries));
    }

    pub fn disable_cache(&self) {
        *self.lock_cache() = None;
    }

    /// Run a select. Answered from the row cache when the filter pins the
    /// primary key and the cached row satisfies every other equality.
    pub async fn select(&self, request: Select) -> Result<Vec<Row>> {
        let db = self.db()?;
        if let Some(rows) = self.select_cached(&request) {
            trace!(table = self.name(), "row cache hit");
            return Ok(rows);
        }

        let plan = {
            let registry = db.registry();
            build_select(&*registry, db.dialect, &self.schema, &request)?
        };
        let epoch = self.epoch.load(Ordering::SeqCst);
        let raw = db
            .submit(plan.statement.clone())
            .await
            .map_err(|e| e.with_table(self.name()))?
            .into_rows();
        let rows = plan.decode(raw)?;
        if plan.whole_rows {
            self.store_rows(epoch, &rows);
        }
        Ok(rows)
    }

    /// Insert one row. Returns the row as written, after coercion.
    ///
    /// Values that cannot be represented in their column are dropped with a
    /// warning and the insert proceeds without them.
    pub async fn insert<S, V>(&self, values: impl IntoIterator<Item = (S, V)>) -> Result<Row>
    where
        S: Into<String>,
        V: Into<Value>,
    {
        let db = self.db()?;
        let plan = build_insert(db.dialect, &self.schema, collect_pairs(values))?;
        let ticket = self.begin_write();
        db.submit(plan.statement.clone())
            .await
            .map_err(|e| e.with_table(self.name()))?;

        if plan.is_complete(&self.schema) {
            let key = RowKey::from(&plan.row[self.schema.primary_key()]);
            self.finish_write(ticket, |cache, in_order| {
                if in_order {
                    cache.set(key, plan.row.clone());
                } else {
                    cache.delete(&key);
                }
            });
        } else {
            self.finish_write(ticket, |_, _| {});
        }
        Ok(plan.row)
    }

    /// Update matching rows. `None` updates every row.
    pub async fn update<S, V>(
        &self,
        set: impl IntoIterator<Item = (S, V)>,
        filter: Option<Where>,
    ) -> Result<u64>
    where
        S: Into<String>,
        V: Into<Value>,
    {
        let db = self.db()?;
        let plan = build_update(db.dialect, &self.schema, collect_pairs(set), filter.as_ref())?;
        let dependents = self.dependents(&db);
        let statement = tag(plan.statement, &dependents);

        let ticket = self.begin_write();
        let affected = db
            .submit(statement)
            .await
            .map_err(|e| e.with_table(self.name()))?
            .affected();

        self.apply_update(ticket, filter.as_ref(), &plan.changes, db.dialect);
        db.clear_row_caches(&dependents);
        Ok(affected)
    }

    /// Delete matching rows. Without a filter, `all_rows` must be set.
    pub async fn delete(&self, filter: Option<Where>, all_rows: bool) -> Result<u64> {
        let db = self.db()?;
        let statement = build_delete(db.dialect, &self.schema, filter.as_ref(), all_rows)?;
        let dependents = self.dependents(&db);
        let statement = tag(statement, &dependents);

        let ticket = self.begin_write();
        let affected = db
            .submit(statement)
            .await
            .map_err(|e| e.with_table(self.name()))?
            .affected();

        self.apply_delete(ticket, filter.as_ref(), db.dialect);
        db.clear_row_caches(&dependents);
        Ok(affected)
    }

    /// Look up one row by primary key.
    pub async fn get(&self, key: impl Into<Value>) -> Result<Option<Item>> {
        let filter = Where::eq(self.schema.primary_key(), key);
        let mut rows = self.select(Select::all().filter(filter)).await?;
        let Some(row) = rows.pop() else {
            return Ok(None);
        };
        Ok(Some(match self.schema.value_column() {
            Some(column) => Item::Value(row.get(&column.name).cloned().unwrap_or(Value::Null)),
            None => Item::Row(row),
        }))
    }

    /// Insert or update the row stored under `key`.
    pub async fn set(&self, key: impl Into<Value>, item: impl Into<Item>) -> Result<()> {
        let key = key.into();
        let pk = self.schema.primary_key().to_string();
        let mut values: Vec<(String, Value)> = match (item.into(), self.schema.value_column()) {
            (Item::Value(value), Some(column)) => vec![(column.name.clone(), value)],
            (Item::Value(_), None) => {
                return Err(Error::invalid_input(
                    self.name(),
                    "a scalar value is only accepted by two-column tables, pass a row",
                ))
            }
            (Item::Row(row), _) => row.into_iter().filter(|(column, _)| *column != pk).collect(),
        };

        if self.contains_key(key.clone()).await? {
            if values.is_empty() {
                return Ok(());
            }
            self.update(values, Some(Where::eq(pk, key))).await?;
        } else {
            values.push((pk, key));
            self.insert(values).await?;
        }
        Ok(())
    }

    pub async fn contains_key(&self, key: impl Into<Value>) -> Result<bool> {
        let key = key.into();
        let pk = self.schema.primary_key();
        if let Ok(coerced) = codec::coerce(self.schema.primary_key_column(), key.clone()) {
            if self
                .lock_cache()
                .as_ref()
                .is_some_and(|cache| cache.contains(&RowKey::from(&coerced)))
            {
                return Ok(true);
            }
        }
        let rows = self
            .select(Select::columns([pk]).filter(Where::eq(pk, key)))
            .await?;
        Ok(!rows.is_empty())
    }

    /// Delete the row stored under `key`. Returns whether a row was removed.
    pub async fn remove(&self, key: impl Into<Value>) -> Result<bool> {
        let filter = Where::eq(self.schema.primary_key(), key);
        Ok(self.delete(Some(filter), false).await? > 0)
    }

    /// Stream every row of the table.
    pub async fn rows(&self) -> Result<impl Stream<Item = Row>> {
        let rows = self.select(Select::all()).await?;
        Ok(tokio_stream::iter(rows))
    }

    fn db(&self) -> Result<Arc<DatabaseInner>> {
        self.db.upgrade().ok_or(Error::ShuttingDown)
    }

    fn lock_cache(&self) -> MutexGuard<'_, Option<RowCache>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn clear_cache(&self) {
        let mut cache = self.lock_cache();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(cache) = cache.as_mut() {
            cache.clear();
        }
    }

    /// Start a write. Returns the epoch the write owns until it finishes.
    fn begin_write(&self) -> u64 {
        let _guard = self.lock_cache();
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a completed write's cache effects. `in_order` is false when
    /// another write or clear ran since `ticket`, in which case only
    /// removals are safe.
    fn finish_write(&self, ticket: u64, apply: impl FnOnce(&mut RowCache, bool)) {
        let mut guard = self.lock_cache();
        let in_order = self.epoch.load(Ordering::SeqCst) == ticket;
        if let Some(cache) = guard.as_mut() {
            apply(cache, in_order);
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn store_rows(&self, epoch: u64, rows: &[Row]) {
        let mut guard = self.lock_cache();
        let Some(cache) = guard.as_mut() else {
            return;
        };
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(table = self.name(), "write raced select, not caching rows");
            return;
        }
        let pk = self.schema.primary_key();
        for row in rows {
            match row.get(pk) {
                Some(key) if !key.is_null() => cache.set(RowKey::from(key), row.clone()),
                _ => {}
            }
        }
    }

    fn dependents(&self, db: &DatabaseInner) -> BTreeSet<String> {
        dependent_tables(&*db.registry(), self.name())
    }

    /// Map a column reference onto this table, if it names one of its columns.
    fn local_column<'a>(&self, reference: &'a str) -> Option<&'a str> {
        let column = match reference.split_once('.') {
            Some((table, column)) if table == self.name() => column,
            Some(_) => return None,
            None => reference,
        };
        self.schema.has_column(column).then_some(column)
    }

    fn matcher(&self, filter: Option<&Where>, dialect: Dialect) -> Matcher {
        let pairs = match filter {
            None => return Matcher::All,
            Some(Where::Map(pairs)) if pairs.is_empty() => return Matcher::All,
            Some(Where::Map(pairs)) => pairs,
            Some(Where::Conditions(_)) => return Matcher::Unknown,
        };

        let mut key = None;
        let mut rest = Vec::with_capacity(pairs.len());
        for (reference, value) in pairs {
            let Some(name) = self.local_column(reference) else {
                return Matcher::Unknown;
            };
            let Some(column) = self.schema.column(name) else {
                return Matcher::Unknown;
            };
            let Ok(coerced) = codec::coerce(column, value.clone()) else {
                return Matcher::Unknown;
            };
            if name == self.schema.primary_key() && key.is_none() {
                key = Some(RowKey::from(&coerced));
            } else {
                rest.push((name.to_string(), coerced));
            }
        }

        match key {
            Some(key) => Matcher::Key(key, rest),
            // Text comparison rules of other backends (collations) may differ
            // from exact equality, so only SQLite rows are scanned.
            None if dialect == Dialect::Sqlite => Matcher::Scan(rest),
            None => Matcher::Unknown,
        }
    }

    fn select_cached(&self, request: &Select) -> Option<Vec<Row>> {
        if request.join.is_some() {
            return None;
        }
        if let Some(order) = &request.order_by {
            self.local_column(&order.column)?;
        }
        let Matcher::Key(key, rest) = self.matcher(request.filter.as_ref(), Dialect::Sqlite) else {
            return None;
        };

        let row = self.lock_cache().as_mut()?.get(&key)?.clone();
        if !matches(&row, &rest) {
            return Some(Vec::new());
        }
        match &request.selection {
            Selection::All => Some(vec![row]),
            Selection::Columns(names) => {
                let mut narrowed = Row::new();
                for name in names {
                    let value = row.get(self.local_column(name)?)?;
                    narrowed.insert(name.clone(), value.clone());
                }
                Some(vec![narrowed])
            }
        }
    }

    fn apply_update(&self, ticket: u64, filter: Option<&Where>, changes: &Row, dialect: Dialect) {
        let matcher = self.matcher(filter, dialect);
        let rekeyed = changes.contains_key(self.schema.primary_key());
        let apply = |row: &mut Row| {
            for (column, value) in changes {
                row.insert(column.clone(), value.clone());
            }
        };
        self.finish_write(ticket, |cache, in_order| match matcher {
            _ if rekeyed => cache.clear(),
            Matcher::Key(key, _) if !in_order => {
                cache.delete(&key);
            }
            _ if !in_order => {
                debug!(table = self.name(), "update finished out of order, clearing cache");
                cache.clear();
            }
            Matcher::Key(key, rest) => {
                if let Some(row) = cache.get_mut(&key) {
                    if matches(row, &rest) {
                        apply(row);
                    }
                }
            }
            Matcher::Scan(rest) => cache.values_mut().filter(|row| matches(row, &rest)).for_each(apply),
            Matcher::All => cache.values_mut().for_each(apply),
            Matcher::Unknown => cache.clear(),
        });
    }

    fn apply_delete(&self, ticket: u64, filter: Option<&Where>, dialect: Dialect) {
        let matcher = self.matcher(filter, dialect);
        self.finish_write(ticket, |cache, in_order| match matcher {
            Matcher::Key(key, rest) => {
                if !in_order || cache.peek(&key).is_some_and(|row| matches(row, &rest)) {
                    cache.delete(&key);
                }
            }
            Matcher::Scan(rest) if in_order => cache.retain(|_, row| !matches(row, &rest)),
            Matcher::Scan(_) | Matcher::All | Matcher::Unknown => cache.clear(),
        });
    }
}

fn matches(row: &Row, pairs: &[(String, Value)]) -> bool {
    pairs.iter().all(|(column, value)| row.get(column) == Some(value))
}

fn collect_pairs<S: Into<String>, V: Into<Value>>(
    values: impl IntoIterator<Item = (S, V)>,
) -> Vec<(String, Value)> {
    values.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Widen a write's table tags to the tables its foreign keys cascade into.
fn tag(mut statement: Statement, dependents: &BTreeSet<String>) -> Statement {
    statement.tables.extend(dependents.iter().cloned());
    statement
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Row> for Item {
    fn from(row: Row) -> Self {
        Self::Row(row)
    }
}

macro_rules! item_from_scalar {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Item {
            fn from(v: $ty) -> Self {
                Self::Value(v.into())
            }
        })*
    };
}

item_from_scalar!(i64, i32, f64, bool, &str, String, serde_json::Value);

impl Catalog for HashMap<String, Arc<Table>> {
    fn table(&self, name: &str) -> Option<&TableSchema> {
        self.get(name).map(|t| t.schema())
    }

    fn schemas(&self) -> Box<dyn Iterator<Item = &TableSchema> + '_> {
        Box::new(self.values().map(|t| t.schema()))
    }
}
