//! Liveness probe.
//!
//! On every tick the probe writes the current time into a one-row heartbeat
//! table and reads it back through the normal queue. A round trip that does
//! not finish within the timeout marks the engine [`Degraded`]; the next
//! successful one marks it ready again. A broken connection surfaces as a
//! connection-level error on the heartbeat itself, which sends the consumer
//! through its restart path even when no user traffic is flowing.
//!
//! [`Degraded`]: EngineHealth::Degraded

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::{BackendConnection, BackendError};
use crate::engine::{EngineHandle, EngineHealth};
use crate::error::{Error, Result};
use crate::now_millis;
use crate::query::Statement;
use crate::value::Value;

/// Table holding the heartbeat row. Hidden from the table registry.
pub const HEARTBEAT_TABLE: &str = "rowgate_heartbeat";

/// Create and seed the heartbeat table on a fresh connection.
pub(crate) fn ensure_table(conn: &mut dyn BackendConnection) -> Result<(), BackendError> {
    conn.execute(&format!(
        "CREATE TABLE IF NOT EXISTS {HEARTBEAT_TABLE} (id INTEGER PRIMARY KEY, beat INTEGER)"
    ))?;
    let seeded = conn.query(&format!("SELECT id FROM {HEARTBEAT_TABLE} WHERE id = 1"))?;
    if seeded.is_empty() {
        conn.execute(&format!("INSERT INTO {HEARTBEAT_TABLE} (id, beat) VALUES (1, 0)"))?;
    }
    Ok(())
}

pub(crate) async fn run(
    handle: EngineHandle,
    health: Arc<watch::Sender<EngineHealth>>,
    period: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match tokio::time::timeout(timeout, beat(&handle)).await {
            Ok(Ok(())) => {
                debug!("heartbeat ok");
                health.send_if_modified(|state| {
                    let recovered = *state == EngineHealth::Degraded;
                    if recovered {
                        *state = EngineHealth::Ready;
                    }
                    recovered
                });
            }
            Ok(Err(Error::ShuttingDown)) => break,
            Ok(Err(Error::EngineFailed(reason))) => {
                error!(reason = %reason, "heartbeat stopped, engine failed");
                break;
            }
            Ok(Err(e)) => warn!(error = %e, "heartbeat failed"),
            Err(_) => {
                error!(timeout_ms = timeout.as_millis() as u64, "heartbeat timed out");
                health.send_if_modified(|state| {
                    let degrade = *state == EngineHealth::Ready;
                    if degrade {
                        *state = EngineHealth::Degraded;
                    }
                    degrade
                });
            }
        }
    }
    debug!("liveness probe stopped");
}

async fn beat(handle: &EngineHandle) -> Result<()> {
    let tables = BTreeSet::from([HEARTBEAT_TABLE.to_string()]);
    let now = now_millis();
    handle
        .submit(Statement::write(
            format!("UPDATE {HEARTBEAT_TABLE} SET beat = {now} WHERE id = 1"),
            tables.clone(),
        ))
        .await?;
    let rows = handle
        .submit(Statement::read(
            format!("SELECT beat FROM {HEARTBEAT_TABLE} WHERE id = 1"),
            tables,
        ))
        .await?
        .into_rows();
    match rows.first().and_then(|row| row.first()) {
        Some(Value::Int(beat)) if *beat == now => Ok(()),
        other => Err(Error::Statement {
            table: HEARTBEAT_TABLE.to_string(),
            sql: format!("SELECT beat FROM {HEARTBEAT_TABLE} WHERE id = 1"),
            message: format!("read back {other:?}, expected {now}"),
        }),
    }
}
