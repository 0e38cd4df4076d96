//! Logging initialisation.
//!
//! A single root subscriber that every other module logs through.
//! `tracing`'s span/field model lets call sites attach structured fields
//! (`namespace`, `name`, `resource_version`, ...) to a span instead of
//! threading a logger name down the call stack.

use serde::Serialize;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Output format for log lines, selectable via CLI flag or env var on the
/// demo binary.
#[derive(clap::ValueEnum, Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON-formatted log output, one object per line.
    Json,
    /// Human-readable plain-text log output.
    Text,
}

/// Installs the global `tracing` subscriber. `log_filter` is an
/// `EnvFilter` directive string (e.g. `"info,kube=debug"`).
pub fn init(log_filter: &str, log_format: LogFormat) -> Result<(), crate::error::Error> {
    let logger = match log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    let filter = EnvFilter::try_new(log_filter)
        .map_err(|e| crate::error::Error::Config(format!("invalid log filter: {e}")))?;
    let collector = Registry::default().with(logger).with(filter);
    tracing::subscriber::set_global_default(collector)
        .map_err(|e| crate::error::Error::Config(format!("logging already initialised: {e}")))
}
