//! Single-writer query engine.
//!
//! One dedicated consumer thread owns the backend connection. Callers submit
//! statements over an unbounded channel and await a per-request oneshot:
//!
//! - reads flush the open batch, then execute immediately
//! - writes execute inside the open transaction; replies are held until the
//!   batch commits
//! - the batch commits when the queue drains, when the batching window
//!   elapses, or when it reaches its size bound
//! - a connection-level failure restarts the consumer on a fresh connection,
//!   keeping everything still queued
//!
//! A liveness probe ([`probe`]) pushes heartbeat traffic through the same
//! queue so a wedged or broken connection is noticed without user traffic.

pub mod batch;
mod consumer;
pub mod probe;

pub use batch::{BatchAccumulator, BatchConfig};

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::backend::{BackendConnector, RawRows};
use crate::cache::StatementCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::generate_query_id;
use crate::query::Statement;

use consumer::Consumer;

/// Statement-result cache shared between the database and its consumer.
/// `None` while caching is disabled.
pub type SharedStatementCache = Arc<Mutex<Option<StatementCache>>>;

/// Observable state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHealth {
    /// Establishing the first connection.
    Starting,
    /// Serving requests.
    Ready,
    /// Reconnecting after a connection-level failure.
    Restarting { attempt: u32 },
    /// Serving, but the last heartbeat did not complete in time.
    Degraded,
    /// Restart budget exhausted; every request fails.
    Failed,
}

impl fmt::Display for EngineHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Restarting { attempt } => write!(f, "restarting (attempt {attempt})"),
            Self::Degraded => f.write_str("degraded"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Engine tuning, usually derived from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub batch: BatchConfig,
    /// Consecutive reconnect attempts allowed before the engine fails.
    pub max_restarts: u32,
    /// Delay before the first reconnect; doubled per attempt.
    pub restart_backoff: Duration,
    /// `None` disables the liveness probe.
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            max_restarts: 5,
            restart_backoff: Duration::from_millis(50),
            heartbeat_interval: Some(Duration::from_secs(5)),
            heartbeat_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch: BatchConfig::from_config(config.batch_size, config.batch_window_ms),
            max_restarts: config.max_restarts,
            restart_backoff: Duration::from_millis(config.restart_backoff_ms),
            heartbeat_interval: (config.heartbeat_interval_ms > 0)
                .then(|| Duration::from_millis(config.heartbeat_interval_ms)),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
        }
    }
}

/// Result of one executed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(RawRows),
    Affected(u64),
}

impl Outcome {
    pub fn into_rows(self) -> RawRows {
        match self {
            Self::Rows(rows) => rows,
            Self::Affected(_) => Vec::new(),
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            Self::Rows(rows) => rows.len() as u64,
            Self::Affected(n) => *n,
        }
    }
}

pub(crate) struct Request {
    pub(crate) id: Uuid,
    pub(crate) statement: Statement,
    pub(crate) reply: oneshot::Sender<Result<Outcome>>,
    pub(crate) enqueued_at: Instant,
}

pub(crate) enum Command {
    Run(Request),
    /// Sentinel pushed on close so a consumer blocked on the queue wakes up.
    Shutdown,
}

/// Cloneable submission side of the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
    health: watch::Receiver<EngineHealth>,
}

impl EngineHandle {
    /// Queue a statement and wait for its outcome.
    ///
    /// Statement failures come back as [`Error::Statement`]. A request that
    /// was executing when the connection died resolves to
    /// [`Error::RequestLost`]; requests still queued at that point are
    /// served by the restarted consumer.
    pub async fn submit(&self, statement: Statement) -> Result<Outcome> {
        if self.health() == EngineHealth::Failed {
            return Err(failed());
        }
        let (reply, rx) = oneshot::channel();
        let request = Request {
            id: generate_query_id(),
            statement,
            reply,
            enqueued_at: Instant::now(),
        };
        if self.tx.send(Command::Run(request)).is_err() {
            return Err(if self.health() == EngineHealth::Failed {
                failed()
            } else {
                Error::ShuttingDown
            });
        }
        rx.await.unwrap_or(Err(Error::RequestLost))
    }

    pub fn health(&self) -> EngineHealth {
        *self.health.borrow()
    }

    /// Watch health transitions.
    pub fn subscribe_health(&self) -> watch::Receiver<EngineHealth> {
        self.health.clone()
    }
}

fn failed() -> Error {
    Error::EngineFailed("restart budget exhausted".into())
}

/// Owner of the consumer thread and the liveness probe.
pub struct Engine {
    handle: EngineHandle,
    thread: Option<JoinHandle<()>>,
    probe: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Engine {
    /// Spawn the consumer and wait for its first connection.
    pub async fn start(
        connector: Arc<dyn BackendConnector>,
        config: EngineConfig,
        cache: SharedStatementCache,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = watch::channel(EngineHealth::Starting);
        let health_tx = Arc::new(health_tx);
        let (ready_tx, ready_rx) = oneshot::channel();

        let consumer = Consumer::new(connector, rx, Arc::clone(&health_tx), cache, config.clone());
        let thread = std::thread::Builder::new()
            .name("rowgate-engine".into())
            .spawn(move || consumer.run(ready_tx))
            .map_err(|e| Error::EngineFailed(format!("failed to spawn engine thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Backend(e)),
            Err(_) => return Err(Error::EngineFailed("engine exited during startup".into())),
        }

        let handle = EngineHandle {
            tx,
            health: health_rx,
        };
        let cancel = CancellationToken::new();
        let probe = config.heartbeat_interval.map(|interval| {
            tokio::spawn(probe::run(
                handle.clone(),
                health_tx,
                interval,
                config.heartbeat_timeout,
                cancel.clone(),
            ))
        });
        info!(batch_size = config.batch.max_batch_size, "engine started");

        Ok(Self {
            handle,
            thread: Some(thread),
            probe,
            cancel,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn health(&self) -> EngineHealth {
        self.handle.health()
    }

    /// Stop the probe, flush pending writes, reject whatever is still queued
    /// with [`Error::ShuttingDown`] and join the consumer thread.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(probe) = self.probe.take() {
            let _ = probe.await;
        }
        let _ = self.handle.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!("engine thread joined"),
                Ok(Err(_)) => error!("engine thread panicked"),
                Err(e) => error!(error = %e, "failed to join engine thread"),
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.thread.is_some() {
            let _ = self.handle.tx.send(Command::Shutdown);
        }
    }
}
