//! Test utilities shared by the integration tests.
//!
//! Provides:
//! - A temporary database fixture
//! - A connector wrapper that injects connection failures
//! - Seed data for the join scenarios

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rowgate::backend::{BackendConnection, BackendConnector, BackendError, RawRows, SqliteConnector};
use rowgate::codec::Dialect;
use rowgate::{ColumnType, Config, Database, ForeignKey, Result, Table, TableSchema, Value};
use tempfile::TempDir;

/// Fast batching, no heartbeat, millisecond restart backoff.
pub fn test_config(database: &Path) -> Config {
    Config {
        database: database.to_path_buf(),
        batch_window_ms: 5,
        heartbeat_interval_ms: 0,
        restart_backoff_ms: 1,
        ..Config::default()
    }
}

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl TestFixture {
    pub fn new() -> Self {
        rowgate::observability::tracing::init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        Self { temp_dir, db_path }
    }

    pub fn config(&self) -> Config {
        test_config(&self.db_path)
    }

    pub async fn open(&self) -> Database {
        Database::open(self.config()).await.expect("failed to open database")
    }

    pub async fn open_with(&self, config: Config) -> Database {
        Database::open(config).await.expect("failed to open database")
    }

    /// Open over a [`FlakyConnector`] and return its failure switch.
    pub async fn open_flaky(&self, config: Config) -> (Database, Arc<Faults>) {
        let faults = Arc::new(Faults::default());
        let connector = FlakyConnector {
            inner: SqliteConnector::new(&self.db_path),
            faults: Arc::clone(&faults),
        };
        let db = Database::with_connector(config, Arc::new(connector))
            .await
            .expect("failed to open database");
        (db, faults)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met, `false` if the timeout expired.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Failure switches shared between a test and its [`FlakyConnector`].
#[derive(Default)]
pub struct Faults {
    /// Statements still to fail with a connection error.
    fail_statements: AtomicUsize,
    /// Refuse new connections while set.
    refuse_connect: AtomicBool,
}

impl Faults {
    pub fn fail_next(&self, statements: usize) {
        self.fail_statements.store(statements, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_statements
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// SQLite connector whose connections can be made to drop on command.
pub struct FlakyConnector {
    inner: SqliteConnector,
    faults: Arc<Faults>,
}

struct FlakyConnection {
    inner: Box<dyn BackendConnection>,
    faults: Arc<Faults>,
}

impl BackendConnection for FlakyConnection {
    fn query(&mut self, sql: &str) -> Result<RawRows, BackendError> {
        if self.faults.take_failure() {
            return Err(BackendError::connection("simulated connection drop"));
        }
        self.inner.query(sql)
    }

    fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
        if self.faults.take_failure() {
            return Err(BackendError::connection("simulated connection drop"));
        }
        self.inner.execute(sql)
    }
}

impl BackendConnector for FlakyConnector {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        if self.faults.refuse_connect.load(Ordering::SeqCst) {
            return Err(BackendError::connection("simulated refused connection"));
        }
        Ok(Box::new(FlakyConnection {
            inner: self.inner.connect()?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn list_tables_sql(&self) -> String {
        self.inner.list_tables_sql()
    }

    fn describe_table_sqls(&self, table: &str) -> Vec<String> {
        self.inner.describe_table_sqls(table)
    }

    fn parse_table(&self, name: &str, results: Vec<RawRows>) -> Result<TableSchema> {
        self.inner.parse_table(name, results)
    }
}

/// A two-column key/value table.
pub async fn settings_table(db: &Database) -> Arc<Table> {
    let schema = TableSchema::builder("settings")
        .column("key", ColumnType::Text, "")
        .column("value", ColumnType::Text, "")
        .primary_key("key")
        .build()
        .expect("valid schema");
    db.create_table(schema).await.expect("create settings")
}

/// An auto-increment keyed table with a few typed columns.
pub async fn stocks_table(db: &Database) -> Arc<Table> {
    let schema = TableSchema::builder("stocks")
        .column("order_num", ColumnType::Int, "AUTOINCREMENT")
        .column("date", ColumnType::Text, "")
        .column("trans", ColumnType::Text, "")
        .column("symbol", ColumnType::Text, "")
        .column("qty", ColumnType::Float, "")
        .column("price", ColumnType::Float, "")
        .column("after_hours", ColumnType::Bool, "")
        .primary_key("order_num")
        .build()
        .expect("valid schema");
    db.create_table(schema).await.expect("create stocks")
}

pub const POSITIONS: [(&str, i64); 4] = [("Director", 1), ("Manager", 2), ("Rep", 4), ("Intern", 8)];

/// Departments, positions and employees: four departments, four positions
/// per department, and 1/2/4/8 employees per position tier.
pub async fn seed_company(db: &Database) -> (Arc<Table>, Arc<Table>, Arc<Table>) {
    let departments = db
        .create_table(
            TableSchema::builder("departments")
                .column("id", ColumnType::Int, "AUTOINCREMENT")
                .column("name", ColumnType::Text, "UNIQUE NOT NULL")
                .primary_key("id")
                .build()
                .expect("valid schema"),
        )
        .await
        .expect("create departments");
    let positions = db
        .create_table(
            TableSchema::builder("positions")
                .column("id", ColumnType::Int, "AUTOINCREMENT")
                .column("name", ColumnType::Text, "NOT NULL")
                .column("department_id", ColumnType::Int, "")
                .primary_key("id")
                .foreign_key(ForeignKey::new("department_id", "departments", "id"))
                .build()
                .expect("valid schema"),
        )
        .await
        .expect("create positions");
    let employees = db
        .create_table(
            TableSchema::builder("employees")
                .column("id", ColumnType::Int, "AUTOINCREMENT")
                .column("name", ColumnType::Text, "NOT NULL")
                .column("position_id", ColumnType::Int, "")
                .primary_key("id")
                .foreign_key(ForeignKey::new("position_id", "positions", "id").with_modifiers("ON DELETE CASCADE"))
                .build()
                .expect("valid schema"),
        )
        .await
        .expect("create employees");

    let mut position_id = 0;
    for (dept_id, department) in (1i64..).zip(["Sales", "Marketing", "HR", "Engineering"]) {
        departments
            .insert([("id", Value::from(dept_id)), ("name", Value::from(department))])
            .await
            .expect("insert department");
        for (position, headcount) in POSITIONS {
            position_id += 1;
            positions
                .insert([
                    ("id", Value::from(position_id)),
                    ("name", Value::from(position)),
                    ("department_id", Value::from(dept_id)),
                ])
                .await
                .expect("insert position");
            for n in 0..headcount {
                employees
                    .insert([
                        ("name", Value::from(format!("{department} {position} {n}"))),
                        ("position_id", Value::from(position_id)),
                    ])
                    .await
                    .expect("insert employee");
            }
        }
    }
    (departments, positions, employees)
}
