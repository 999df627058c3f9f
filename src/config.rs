//! Configuration for a [`Database`](crate::Database).
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Defaults suitable for a local SQLite file

use clap::{ArgAction, Args, ValueEnum};
use std::path::PathBuf;

use crate::cache::DEFAULT_MAX_ENTRIES;

/// Supported backend families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    #[default]
    Sqlite,
    Mysql,
    Postgres,
}

/// Connection, cache, logging and engine settings.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Database file (sqlite) or database name
    #[arg(short, long, env = "ROWGATE_DATABASE", default_value = "./rowgate.db")]
    pub database: PathBuf,

    /// Backend family
    #[arg(long, env = "ROWGATE_BACKEND", value_enum, default_value_t = BackendKind::Sqlite)]
    pub backend: BackendKind,

    /// User for server backends
    #[arg(long, env = "ROWGATE_USER")]
    pub user: Option<String>,

    /// Password for server backends
    #[arg(long, env = "ROWGATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Host for server backends
    #[arg(long, env = "ROWGATE_HOST")]
    pub host: Option<String>,

    /// Port for server backends
    #[arg(long, env = "ROWGATE_PORT")]
    pub port: Option<u16>,

    /// Enable the per-table row cache and the statement cache
    #[arg(long, env = "ROWGATE_CACHE", default_value_t = true, action = ArgAction::Set)]
    pub cache_enabled: bool,

    /// Maximum entries per cache
    #[arg(long, env = "ROWGATE_MAX_CACHE_ENTRIES", default_value_t = DEFAULT_MAX_ENTRIES)]
    pub max_cache_entries: usize,

    /// Log every generated statement at debug level
    #[arg(long, env = "ROWGATE_DEBUG")]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "ROWGATE_LOG_JSON")]
    pub log_json: bool,

    /// Maximum writes per commit batch
    #[arg(long, env = "ROWGATE_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Maximum time a commit batch stays open, in milliseconds
    #[arg(long, env = "ROWGATE_BATCH_WINDOW_MS", default_value_t = 25)]
    pub batch_window_ms: u64,

    /// Liveness probe interval in milliseconds (0 disables the probe)
    #[arg(long, env = "ROWGATE_HEARTBEAT_INTERVAL_MS", default_value_t = 5000)]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat round trip allowed before the engine is reported degraded
    #[arg(long, env = "ROWGATE_HEARTBEAT_TIMEOUT_MS", default_value_t = 2000)]
    pub heartbeat_timeout_ms: u64,

    /// Consecutive reconnect attempts before the engine gives up
    #[arg(long, env = "ROWGATE_MAX_RESTARTS", default_value_t = 5)]
    pub max_restarts: u32,

    /// Initial reconnect delay in milliseconds, doubled per attempt
    #[arg(long, env = "ROWGATE_RESTART_BACKOFF_MS", default_value_t = 50)]
    pub restart_backoff_ms: u64,
}

impl Config {
    /// Default configuration for a SQLite file.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            database: path.into(),
            ..Self::default()
        }
    }

    /// Fast batching and no heartbeat, for tests.
    #[cfg(test)]
    pub fn test_config(database: PathBuf) -> Self {
        Self {
            database,
            log_level: "debug".into(),
            batch_window_ms: 5,
            heartbeat_interval_ms: 0,
            restart_backoff_ms: 1,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("./rowgate.db"),
            backend: BackendKind::Sqlite,
            user: None,
            password: None,
            host: None,
            port: None,
            cache_enabled: true,
            max_cache_entries: DEFAULT_MAX_ENTRIES,
            debug: false,
            log_level: "info".into(),
            log_json: false,
            batch_size: 100,
            batch_window_ms: 25,
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 2000,
            max_restarts: 5,
            restart_backoff_ms: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.max_cache_entries, 125);
        assert!(config.cache_enabled);
    }

    #[test]
    fn test_cli_defaults_match_default_impl() {
        let parsed = Harness::try_parse_from(["rowgate"]).unwrap().config;
        let mut expected = Config::default();
        // Environment may set RUST_LOG in CI.
        expected.log_level = parsed.log_level.clone();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_cli_overrides() {
        let parsed = Harness::try_parse_from([
            "rowgate",
            "--backend",
            "postgres",
            "--cache-enabled",
            "false",
            "--heartbeat-interval-ms",
            "0",
        ])
        .unwrap()
        .config;
        assert_eq!(parsed.backend, BackendKind::Postgres);
        assert!(!parsed.cache_enabled);
        assert_eq!(parsed.heartbeat_interval_ms, 0);
    }
}
