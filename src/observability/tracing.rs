//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the embedding application. These helpers are what the CLI uses.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Install a global subscriber driven by the configured level and format.
///
/// `RUST_LOG` directives win over `config.log_level`; `config.debug` lowers
/// the default to `debug`. Returns an error if a global subscriber is already
/// installed.
pub fn init_tracing(config: &Config) -> Result<(), tracing_subscriber::util::TryInitError> {
    let level = if config.debug { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    tracing::debug!(
        level = level,
        json = config.log_json,
        "tracing initialized"
    );
    Ok(())
}

/// Initialize tracing for tests (only logs errors).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("error")
        .with_test_writer()
        .try_init();
}
