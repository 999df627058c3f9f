//! Database handle: table registry, engine ownership and raw SQL access.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendConnector, RawRows, SqliteConnector};
use crate::cache::StatementCache;
use crate::codec::Dialect;
use crate::config::{BackendKind, Config};
use crate::engine::probe::HEARTBEAT_TABLE;
use crate::engine::{Engine, EngineConfig, EngineHandle, EngineHealth, Outcome, SharedStatementCache};
use crate::error::{Error, Result};
use crate::query::{drop_table_sql, Statement};
use crate::schema::TableSchema;
use crate::table::Table;

pub(crate) struct DatabaseInner {
    pub(crate) config: Config,
    pub(crate) dialect: Dialect,
    connector: Arc<dyn BackendConnector>,
    handle: EngineHandle,
    engine: Mutex<Option<Engine>>,
    registry: RwLock<HashMap<String, Arc<Table>>>,
    statement_cache: SharedStatementCache,
    cache_enabled: AtomicBool,
    /// Serializes table creation and removal.
    ddl: tokio::sync::Mutex<()>,
}

impl DatabaseInner {
    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Table>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn submit(&self, statement: Statement) -> Result<Outcome> {
        if self.config.debug {
            debug!(sql = %statement.sql, "submitting statement");
        } else {
            trace!(sql = %statement.sql, "submitting statement");
        }
        self.handle.submit(statement).await
    }

    pub(crate) fn clear_row_caches(&self, names: &BTreeSet<String>) {
        if names.is_empty() {
            return;
        }
        let registry = self.registry();
        for name in names {
            if let Some(table) = registry.get(name) {
                table.clear_cache();
            }
        }
    }

    fn clear_all_row_caches(&self) {
        for table in self.registry().values() {
            table.clear_cache();
        }
    }
}

/// A connection-backed set of tables.
///
/// Cloning is cheap; every clone shares the same engine and registry.
///
/// ```no_run
/// use rowgate::{ColumnType, Config, Database, TableSchema, Value, Where};
///
/// # async fn run() -> rowgate::Result<()> {
/// let db = Database::open(Config::sqlite("stocks.db")).await?;
/// let stocks = db
///     .create_table(
///         TableSchema::builder("stocks")
///             .column("order_num", ColumnType::Int, "AUTOINCREMENT")
///             .column("symbol", ColumnType::Text, "")
///             .column("qty", ColumnType::Float, "")
///             .primary_key("order_num")
///             .build()?,
///     )
///     .await?;
/// stocks.insert([("symbol", Value::from("RHAT")), ("qty", Value::from(100.0))]).await?;
/// stocks.update([("qty", 50.0)], Some(Where::eq("symbol", "RHAT"))).await?;
/// db.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open a database with the built-in connector for `config.backend` and
    /// load the schemas of its existing tables.
    pub async fn open(config: Config) -> Result<Self> {
        let connector: Arc<dyn BackendConnector> = match config.backend {
            BackendKind::Sqlite => Arc::new(SqliteConnector::new(&config.database)),
            other => {
                return Err(Error::invalid_input(
                    format!("{other:?}").to_lowercase(),
                    "no built-in connector for this backend, use Database::with_connector",
                ))
            }
        };
        Self::with_connector(config, connector).await
    }

    /// Open a database over a caller-supplied connector.
    pub async fn with_connector(config: Config, connector: Arc<dyn BackendConnector>) -> Result<Self> {
        let statement_cache: SharedStatementCache = Arc::new(Mutex::new(
            config
                .cache_enabled
                .then(|| StatementCache::new(config.max_cache_entries)),
        ));
        let engine = Engine::start(
            Arc::clone(&connector),
            EngineConfig::from_config(&config),
            Arc::clone(&statement_cache),
        )
        .await?;

        let db = Self {
            inner: Arc::new(DatabaseInner {
                dialect: connector.dialect(),
                cache_enabled: AtomicBool::new(config.cache_enabled),
                config,
                connector,
                handle: engine.handle(),
                engine: Mutex::new(Some(engine)),
                registry: RwLock::new(HashMap::new()),
                statement_cache,
                ddl: tokio::sync::Mutex::new(()),
            }),
        };
        db.load_tables().await?;
        info!(
            database = %db.inner.config.database.display(),
            backend = db.inner.dialect.name(),
            tables = db.inner.registry().len(),
            "database opened"
        );
        Ok(db)
    }

    /// Register every existing table the backend can describe. Tables whose
    /// schema cannot be represented are skipped with a warning.
    async fn load_tables(&self) -> Result<()> {
        let inner = &self.inner;
        let names = self.query(&inner.connector.list_tables_sql()).await?;
        let names = names
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter_map(|cell| cell.as_str().map(str::to_string))
            .filter(|name| name != HEARTBEAT_TABLE);

        let mut loaded = Vec::new();
        for name in names {
            let mut results = Vec::new();
            for sql in inner.connector.describe_table_sqls(&name) {
                results.push(self.query(&sql).await?);
            }
            match inner.connector.parse_table(&name, results) {
                Ok(schema) => loaded.push(schema),
                Err(e) => warn!(table = %name, error = %e, "skipping table"),
            }
        }

        let mut registry = inner.registry.write().unwrap_or_else(PoisonError::into_inner);
        for schema in loaded {
            debug!(table = schema.name(), "loaded table");
            let table = self.new_table(schema);
            registry.insert(table.name().to_string(), table);
        }
        Ok(())
    }

    fn new_table(&self, schema: TableSchema) -> Arc<Table> {
        Arc::new(Table::new(
            schema,
            Arc::downgrade(&self.inner),
            self.inner.cache_enabled.load(Ordering::SeqCst),
            self.inner.config.max_cache_entries,
        ))
    }

    /// Create a table, or return the registered one when it already exists
    /// with the same columns and primary key.
    pub async fn create_table(&self, schema: TableSchema) -> Result<Arc<Table>> {
        let _ddl = self.inner.ddl.lock().await;

        if let Some(existing) = self.table(schema.name()) {
            return if same_shape(existing.schema(), &schema) {
                Ok(existing)
            } else {
                Err(Error::invalid_input(
                    schema.name(),
                    "table exists with a different schema",
                ))
            };
        }
        {
            let registry = self.inner.registry();
            for fk in schema.foreign_keys() {
                let target = if fk.table == schema.name() {
                    Some(&schema)
                } else {
                    registry.get(&fk.table).map(|t| t.schema())
                };
                let Some(target) = target else {
                    return Err(Error::invalid_input(&fk.table, "foreign key references an unknown table"));
                };
                if !target.has_column(&fk.reference) {
                    return Err(Error::invalid_input(
                        format!("{}.{}", fk.table, fk.reference),
                        "foreign key references an unknown column",
                    ));
                }
            }
        }

        let sql = self.inner.connector.render_create_table(&schema);
        let tables = BTreeSet::from([schema.name().to_string()]);
        self.inner.submit(Statement::write(sql, tables)).await?;

        let table = self.new_table(schema);
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.name().to_string(), Arc::clone(&table));
        info!(table = table.name(), "table created");
        Ok(table)
    }

    /// Drop a table from the backend and the registry.
    pub async fn remove_table(&self, name: &str) -> Result<()> {
        let _ddl = self.inner.ddl.lock().await;
        if !self.contains(name) {
            return Err(Error::invalid_input(name, "table does not exist"));
        }
        let tables = BTreeSet::from([name.to_string()]);
        self.inner.submit(Statement::write(drop_table_sql(name), tables)).await?;
        let removed = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(table) = removed {
            table.clear_cache();
        }
        info!(table = name, "table removed");
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.inner.registry().get(name).cloned()
    }

    /// Registered tables, sorted by name.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<_> = self.inner.registry().values().cloned().collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.registry().contains_key(name)
    }

    /// Submit a prepared statement to the engine.
    ///
    /// Writes clear the row caches of their tagged tables (all tables when
    /// untagged) before and after running, so a select overlapping the
    /// write cannot leave pre-write rows behind.
    pub async fn execute(&self, statement: Statement) -> Result<Outcome> {
        if statement.is_read() {
            return self.inner.submit(statement).await;
        }
        let tables = statement.tables.clone();
        self.clear_for_write(&tables);
        let outcome = self.inner.submit(statement).await;
        self.clear_for_write(&tables);
        outcome
    }

    fn clear_for_write(&self, tables: &BTreeSet<String>) {
        if tables.is_empty() {
            self.inner.clear_all_row_caches();
        } else {
            self.inner.clear_row_caches(tables);
        }
    }

    /// Run raw SQL that returns rows. Results are not cached.
    pub async fn query(&self, sql: &str) -> Result<RawRows> {
        Ok(self.inner.submit(Statement::read(sql, BTreeSet::new())).await?.into_rows())
    }

    /// Run raw SQL that modifies data. Every cache is cleared since the
    /// statement may touch any table.
    pub async fn run(&self, sql: &str) -> Result<u64> {
        self.inner.clear_all_row_caches();
        let outcome = self.inner.submit(Statement::write(sql, BTreeSet::new())).await?;
        self.inner.clear_all_row_caches();
        Ok(outcome.affected())
    }

    /// Enable the statement cache and every table's row cache.
    pub fn enable_cache(&self) {
        self.inner.cache_enabled.store(true, Ordering::SeqCst);
        {
            let mut cache = self
                .inner
                .statement_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if cache.is_none() {
                *cache = Some(StatementCache::new(self.inner.config.max_cache_entries));
            }
        }
        for table in self.tables() {
            if !table.is_cache_enabled() {
                table.enable_cache();
            }
        }
    }

    /// Disable and drop every cache.
    pub fn disable_cache(&self) {
        self.inner.cache_enabled.store(false, Ordering::SeqCst);
        *self
            .inner
            .statement_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        for table in self.tables() {
            table.disable_cache();
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn health(&self) -> EngineHealth {
        self.inner.handle.health()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<EngineHealth> {
        self.inner.handle.subscribe_health()
    }

    /// Stop the engine. Pending writes are committed; requests still queued
    /// fail with [`Error::ShuttingDown`]. Later calls are no-ops.
    pub async fn close(&self) {
        let engine = self
            .inner
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut engine) = engine {
            engine.close().await;
            info!("database closed");
        }
    }
}

/// Same column names, types and primary key. Modifiers are not compared
/// because backends do not report all of them back.
fn same_shape(a: &TableSchema, b: &TableSchema) -> bool {
    a.primary_key() == b.primary_key()
        && a.columns().len() == b.columns().len()
        && a
            .columns()
            .iter()
            .zip(b.columns())
            .all(|(x, y)| x.name == y.name && x.column_type == y.column_type)
}
