//! Logging setup shared by the supervisor and worker processes.
//!
//! `RUST_LOG` wins over the configured level. Worker processes must log to
//! stderr: their stdout carries the report protocol.

use crate::config::FleetConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Default filter directives for a configuration
pub fn default_directives(config: Option<&FleetConfig>) -> String {
    let level = config
        .and_then(|c| c.observability.as_ref())
        .map(|o| o.log_level.as_str())
        .unwrap_or("info");

    format!(
        "axonfleet={level},axonfleet_supervisor={level},axonfleet_worker={level},axonfleet_common={level}"
    )
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(config: Option<&FleetConfig>, target: LogTarget) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match target {
        LogTarget::Stdout => registry.with(fmt::layer()).try_init(),
        LogTarget::Stderr => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
