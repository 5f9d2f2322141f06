//! AxonFleet common library
//!
//! This crate contains shared code used by the supervisor and the workers.

pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::FleetConfig;
pub use error::{FleetError, Result};
pub use identity::Identity;
pub use metrics::{MetricsRegistry, METRICS};
