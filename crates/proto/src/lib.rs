//! AxonFleet worker report protocol
//!
//! A worker process talks to its supervisor over its stdout pipe. Every message
//! is one JSON object on its own line, tagged by `type`. The worker sends
//! `started` once it is running, then exactly one of `completed` or `fault`
//! before it exits.

use serde::{Deserialize, Serialize};

/// Message from a worker process to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerReport {
    /// The worker reached its serving loop.
    #[serde(rename = "started")]
    Started {
        /// OS process id of the worker
        pid: u32,
        /// Hotkey the worker serves under
        hotkey: String,
        /// Axon port the worker serves on
        port: u16,
    },

    /// The serving function returned without error.
    #[serde(rename = "completed")]
    Completed,

    /// The serving function failed.
    #[serde(rename = "fault")]
    Fault(Fault),
}

/// A captured worker failure: the error message plus its full diagnostic trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Top-level error message
    pub error: String,

    /// Error chain and backtrace, as rendered in the worker
    pub trace: String,
}

impl Fault {
    /// Create a new fault
    pub fn new(error: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            trace: trace.into(),
        }
    }
}

impl WorkerReport {
    /// Create a fault report
    pub fn fault(error: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::Fault(Fault::new(error, trace))
    }

    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
