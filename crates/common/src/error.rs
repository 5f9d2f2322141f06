//! Common error types for AxonFleet
//!
//! This module defines all error types used across the supervisor and workers.
//! Errors are split by how far they may travel: transient errors stay inside a
//! worker's step loop, everything else crosses the worker boundary and tears
//! the whole fleet down.

use thiserror::Error;

/// Main error type for AxonFleet
#[derive(Error, Debug)]
pub enum FleetError {
    /// Configuration errors (raised before any worker is spawned)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model collaborator errors
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid per-step input (malformed batch weights, non-finite values)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Shared-state (metagraph) access errors
    #[error("Metagraph error: {0}")]
    Metagraph(String),

    /// Publish/pull cycle failed after all retries
    #[error("Weight sync failed: {0}")]
    Sync(String),

    /// Routing collaborator errors
    #[error("Axon error: {0}")]
    Axon(String),

    /// A worker never reached its running state
    #[error("Worker startup failed: {0}")]
    WorkerStartup(String),

    /// A worker faulted; carries the first observed child's trace
    #[error("Child process error in worker {worker}:\n{trace}")]
    ChildProcess { worker: String, trace: String },

    /// Malformed worker report
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for FleetError {
    fn from(err: config::ConfigError) -> Self {
        FleetError::Config(err.to_string())
    }
}

impl FleetError {
    /// Whether a single serving step may swallow this error and keep going.
    ///
    /// Only errors produced while processing one batch qualify. Shared-state
    /// failures and everything structural escalate to the supervisor.
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Model(_) | FleetError::InvalidInput(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        FleetError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        FleetError::Model(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        FleetError::InvalidInput(msg.into())
    }

    /// Create a metagraph error
    pub fn metagraph(msg: impl Into<String>) -> Self {
        FleetError::Metagraph(msg.into())
    }

    /// Create a sync error
    pub fn sync(msg: impl Into<String>) -> Self {
        FleetError::Sync(msg.into())
    }

    /// Create an axon error
    pub fn axon(msg: impl Into<String>) -> Self {
        FleetError::Axon(msg.into())
    }

    /// Create a worker startup error
    pub fn worker_startup(msg: impl Into<String>) -> Self {
        FleetError::WorkerStartup(msg.into())
    }

    /// Create a child process error
    pub fn child_process(worker: impl Into<String>, trace: impl Into<String>) -> Self {
        FleetError::ChildProcess {
            worker: worker.into(),
            trace: trace.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        FleetError::Protocol(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        FleetError::Timeout(msg.into())
    }
}

/// Result type alias for AxonFleet operations
pub type Result<T> = std::result::Result<T, FleetError>;
