//! The consumer loop that owns the backend connection.

use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendConnection, BackendConnector, BackendError, RawRows};
use crate::cache::StatementCache;
use crate::engine::batch::BatchAccumulator;
use crate::engine::{probe, Command, EngineConfig, EngineHealth, Outcome, Request, SharedStatementCache};
use crate::error::Error;
use crate::query::Statement;

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Why a serving session ended.
enum Exit {
    Shutdown,
    /// Every sender is gone.
    Disconnected,
    ConnectionLost(BackendError),
}

/// A write executed inside the open transaction, awaiting commit.
struct Pending {
    request: Request,
    affected: u64,
}

pub(crate) struct Consumer {
    connector: Arc<dyn BackendConnector>,
    rx: mpsc::UnboundedReceiver<Command>,
    health: Arc<watch::Sender<EngineHealth>>,
    cache: SharedStatementCache,
    config: EngineConfig,
    /// Whether any request completed on the current connection.
    served: bool,
}

impl Consumer {
    pub(crate) fn new(
        connector: Arc<dyn BackendConnector>,
        rx: mpsc::UnboundedReceiver<Command>,
        health: Arc<watch::Sender<EngineHealth>>,
        cache: SharedStatementCache,
        config: EngineConfig,
    ) -> Self {
        Self {
            connector,
            rx,
            health,
            cache,
            config,
            served: false,
        }
    }

    /// Thread entry point. Reports the first connection attempt on `ready`,
    /// then serves until shutdown, restarting on connection loss.
    pub(crate) fn run(mut self, ready: oneshot::Sender<Result<(), BackendError>>) {
        let mut conn = match self.connect() {
            Ok(conn) => {
                let _ = ready.send(Ok(()));
                conn
            }
            Err(e) => {
                error!(error = %e, "engine could not connect");
                self.health.send_replace(EngineHealth::Failed);
                let _ = ready.send(Err(e));
                return;
            }
        };

        let mut attempt = 0;
        loop {
            self.health.send_replace(EngineHealth::Ready);
            self.served = false;
            match self.serve(conn.as_mut()) {
                Exit::Shutdown => {
                    let rejected = self.reject_remaining(|| Error::ShuttingDown);
                    info!(rejected, "engine shut down");
                    return;
                }
                Exit::Disconnected => {
                    debug!("all engine handles dropped, consumer exiting");
                    return;
                }
                Exit::ConnectionLost(err) => {
                    if self.served {
                        attempt = 0;
                    }
                    error!(error = %err, "connection lost, restarting engine");
                    drop(conn);
                    self.clear_cache();
                    match self.reconnect(&mut attempt, err) {
                        Some(fresh) => conn = fresh,
                        None => return,
                    }
                }
            }
        }
    }

    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        let mut conn = self.connector.connect()?;
        if self.config.heartbeat_interval.is_some() {
            probe::ensure_table(conn.as_mut())?;
        }
        Ok(conn)
    }

    /// Reconnect with exponential backoff. Returns `None` once the restart
    /// budget is spent, after failing every queued request.
    fn reconnect(
        &mut self,
        attempt: &mut u32,
        mut last: BackendError,
    ) -> Option<Box<dyn BackendConnection>> {
        loop {
            *attempt += 1;
            if *attempt > self.config.max_restarts {
                error!(
                    restarts = self.config.max_restarts,
                    error = %last,
                    "restart budget exhausted, engine failed"
                );
                self.health.send_replace(EngineHealth::Failed);
                let message = format!("restart budget exhausted: {last}");
                self.reject_remaining(|| Error::EngineFailed(message.clone()));
                return None;
            }

            self.health
                .send_replace(EngineHealth::Restarting { attempt: *attempt });
            let delay = backoff(self.config.restart_backoff, *attempt);
            warn!(attempt = *attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            std::thread::sleep(delay);

            match self.connect() {
                Ok(conn) => {
                    info!(attempt = *attempt, "engine reconnected");
                    return Some(conn);
                }
                Err(e) => last = e,
            }
        }
    }

    fn serve(&mut self, conn: &mut dyn BackendConnection) -> Exit {
        let mut batch = BatchAccumulator::new(self.config.batch);
        loop {
            let command = if batch.is_empty() {
                match self.rx.blocking_recv() {
                    Some(command) => command,
                    None => return Exit::Disconnected,
                }
            } else if batch.is_ready() {
                if let Err(e) = self.flush(conn, &mut batch) {
                    return Exit::ConnectionLost(e);
                }
                continue;
            } else {
                match self.rx.try_recv() {
                    Ok(command) => command,
                    Err(TryRecvError::Empty) => {
                        if let Err(e) = self.flush(conn, &mut batch) {
                            return Exit::ConnectionLost(e);
                        }
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => {
                        if let Err(e) = self.flush(conn, &mut batch) {
                            return Exit::ConnectionLost(e);
                        }
                        return Exit::Disconnected;
                    }
                }
            };

            let request = match command {
                Command::Shutdown => {
                    if let Err(e) = self.flush(conn, &mut batch) {
                        warn!(error = %e, "final flush failed");
                    }
                    return Exit::Shutdown;
                }
                Command::Run(request) => request,
            };

            trace!(
                query_id = %request.id,
                queued_us = request.enqueued_at.elapsed().as_micros() as u64,
                sql = %request.statement.sql,
                "dequeued"
            );
            let result = if request.statement.is_read() {
                match self.flush(conn, &mut batch) {
                    Ok(()) => self.read(conn, request),
                    Err(e) => Err(e),
                }
            } else {
                self.write(conn, &mut batch, request)
            };
            if let Err(e) = result {
                return Exit::ConnectionLost(e);
            }
        }
    }

    fn read(&mut self, conn: &mut dyn BackendConnection, request: Request) -> Result<(), BackendError> {
        let Request {
            statement, reply, ..
        } = request;
        if let Some(rows) = self.cached(&statement) {
            self.served = true;
            let _ = reply.send(Ok(Outcome::Rows(rows)));
            return Ok(());
        }
        match conn.query(&statement.sql) {
            Ok(rows) => {
                self.remember(&statement, &rows);
                self.served = true;
                let _ = reply.send(Ok(Outcome::Rows(rows)));
                Ok(())
            }
            Err(e) if e.is_connection() => Err(e),
            Err(e) => {
                let _ = reply.send(Err(statement_error(&statement, &e)));
                Ok(())
            }
        }
    }

    fn write(
        &mut self,
        conn: &mut dyn BackendConnection,
        batch: &mut BatchAccumulator<Pending>,
        request: Request,
    ) -> Result<(), BackendError> {
        if batch.needs_begin() {
            match conn.begin() {
                Ok(()) => batch.open(),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => {
                    let _ = request.reply.send(Err(statement_error(&request.statement, &e)));
                    return Ok(());
                }
            }
        }

        self.invalidate(&request.statement);
        match conn.execute(&request.statement.sql) {
            Ok(affected) => {
                batch.push(Pending { request, affected });
                Ok(())
            }
            Err(e) if e.is_connection() => Err(e),
            Err(e) => {
                let _ = request.reply.send(Err(statement_error(&request.statement, &e)));
                Ok(())
            }
        }
    }

    /// Commit the open batch and release its held replies. A rejected commit
    /// rolls back and fails every write in the batch.
    fn flush(
        &mut self,
        conn: &mut dyn BackendConnection,
        batch: &mut BatchAccumulator<Pending>,
    ) -> Result<(), BackendError> {
        if batch.is_empty() {
            return Ok(());
        }
        let items = batch.drain();
        match conn.commit() {
            Ok(()) => {
                debug!(writes = items.len(), "committed batch");
                if !items.is_empty() {
                    self.served = true;
                }
                for pending in items {
                    let _ = pending.request.reply.send(Ok(Outcome::Affected(pending.affected)));
                }
                Ok(())
            }
            Err(e) if e.is_connection() => Err(e),
            Err(e) => {
                warn!(error = %e, writes = items.len(), "commit rejected, rolling back batch");
                let rollback = conn.rollback();
                for pending in items {
                    let err = statement_error(&pending.request.statement, &e);
                    let _ = pending.request.reply.send(Err(err));
                }
                match rollback {
                    Err(rb) if rb.is_connection() => Err(rb),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Close the queue and fail everything still in it.
    fn reject_remaining(&mut self, reason: impl Fn() -> Error) -> usize {
        self.rx.close();
        let mut rejected = 0;
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Run(request) = command {
                let _ = request.reply.send(Err(reason()));
                rejected += 1;
            }
        }
        rejected
    }

    fn lock_cache(&self) -> MutexGuard<'_, Option<StatementCache>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw statements carry no table tags and are never cached.
    fn cached(&self, statement: &Statement) -> Option<RawRows> {
        if statement.tables.is_empty() {
            return None;
        }
        self.lock_cache().as_mut()?.get(&statement.sql)
    }

    fn remember(&self, statement: &Statement, rows: &RawRows) {
        if statement.tables.is_empty() {
            return;
        }
        if let Some(cache) = self.lock_cache().as_mut() {
            cache.insert(statement.sql.clone(), statement.tables.clone(), rows.clone());
        }
    }

    /// A raw write may touch anything, so it clears the whole cache.
    fn invalidate(&self, statement: &Statement) {
        if let Some(cache) = self.lock_cache().as_mut() {
            if statement.tables.is_empty() {
                cache.clear();
            } else {
                let dropped = cache.invalidate(&statement.tables);
                if dropped > 0 {
                    trace!(dropped, "invalidated cached statements");
                }
            }
        }
    }

    fn clear_cache(&self) {
        if let Some(cache) = self.lock_cache().as_mut() {
            cache.clear();
        }
    }
}

fn statement_error(statement: &Statement, err: &BackendError) -> Error {
    Error::Statement {
        table: statement.primary_table().to_string(),
        sql: statement.sql.clone(),
        message: err.message.clone(),
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::codec::Dialect;
    use crate::engine::batch::BatchConfig;
    use crate::generate_query_id;
    use crate::schema::TableSchema;

    /// Records how many writes each committed transaction held.
    #[derive(Default)]
    struct Commits(Mutex<Vec<usize>>);

    struct SlowConnector(Arc<Commits>);

    struct SlowConnection {
        commits: Arc<Commits>,
        writes: usize,
    }

    impl BackendConnector for SlowConnector {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
            Ok(Box::new(SlowConnection {
                commits: Arc::clone(&self.0),
                writes: 0,
            }))
        }

        fn list_tables_sql(&self) -> String {
            String::new()
        }

        fn describe_table_sqls(&self, _table: &str) -> Vec<String> {
            Vec::new()
        }

        fn parse_table(&self, name: &str, _results: Vec<RawRows>) -> crate::Result<TableSchema> {
            Err(Error::invalid_input(name, "no catalog"))
        }
    }

    impl BackendConnection for SlowConnection {
        fn query(&mut self, _sql: &str) -> Result<RawRows, BackendError> {
            Ok(Vec::new())
        }

        fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
            match sql {
                "BEGIN" => self.writes = 0,
                "COMMIT" => self.commits.0.lock().unwrap().push(self.writes),
                _ => {
                    std::thread::sleep(Duration::from_millis(5));
                    self.writes += 1;
                }
            }
            Ok(1)
        }
    }

    #[test]
    fn test_busy_queue_commits_when_window_closes() {
        let commits = Arc::new(Commits::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut replies = Vec::new();
        for n in 0..40 {
            let (reply, done) = oneshot::channel();
            let statement = Statement::write(format!("INSERT {n}"), BTreeSet::from(["t".to_string()]));
            tx.send(Command::Run(Request {
                id: generate_query_id(),
                statement,
                reply,
                enqueued_at: Instant::now(),
            }))
            .unwrap();
            replies.push(done);
        }
        drop(tx);

        let config = EngineConfig {
            batch: BatchConfig::from_config(1000, 20),
            heartbeat_interval: None,
            ..EngineConfig::default()
        };
        let health = Arc::new(watch::channel(EngineHealth::Starting).0);
        let consumer = Consumer::new(
            Arc::new(SlowConnector(Arc::clone(&commits))),
            rx,
            health,
            Arc::new(Mutex::new(None)),
            config,
        );
        let (ready, started) = oneshot::channel();
        consumer.run(ready);
        assert!(matches!(started.blocking_recv(), Ok(Ok(()))));

        for done in replies {
            assert!(matches!(done.blocking_recv(), Ok(Ok(Outcome::Affected(1)))));
        }
        // Each write takes at least 5ms, so a 20ms window closes after four.
        let sizes = commits.0.lock().unwrap().clone();
        assert_eq!(sizes.iter().sum::<usize>(), 40);
        assert!(sizes.len() >= 10, "{sizes:?}");
        assert!(sizes.iter().all(|&n| n <= 4), "{sizes:?}");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(50);
        assert_eq!(backoff(base, 1), Duration::from_millis(50));
        assert_eq!(backoff(base, 2), Duration::from_millis(100));
        assert_eq!(backoff(base, 4), Duration::from_millis(400));
        assert_eq!(backoff(base, 30), MAX_BACKOFF);
    }
}
