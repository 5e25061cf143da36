//! Shared tracing/logging initialisation.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.
//! `RUST_LOG` wins over the configured level when set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Crates whose events are enabled at the configured level.
const CRATES: &[&str] = &["fanplex", "fanplex_core", "fanplex_mux"];

/// Build the default filter directive for `level`, e.g.
/// `"fanplex=debug,fanplex_core=debug,fanplex_mux=debug"`.
pub fn default_filter(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(log: &LogConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(&log.level)),
    );
    let installed = if log.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}
