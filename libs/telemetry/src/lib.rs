//! Tracing and metric helpers shared by the messaging workers.
//!
//! Metrics go through the `metrics` facade; installing an exporter is left to
//! the embedding process.

use anyhow::Result;

mod config;
mod context;
mod counters;
mod tracing_init;

pub use config::{LogFormat, TelemetryConfig};
pub use context::TelemetryLabels;
pub use counters::{record_counter, record_histogram};
pub use tracing_init::init_tracing;

/// Installs the log subscriber for `service_name`, configured from the environment.
pub fn install(service_name: &str) -> Result<()> {
    init_tracing(&TelemetryConfig::from_env(service_name))
}
