//! AxonFleet Supervisor
//!
//! Fans a shared configuration out into one configuration per serving
//! identity, runs each in its own worker process, and turns the first worker
//! failure into a single error carrying that worker's trace.

pub mod fanout;
pub mod process;
pub mod supervisor;

pub use fanout::fan_out;
pub use process::{ChildHandle, ExitInfo, FaultSlot, SupervisedWorker};
pub use supervisor::{
    ProcessLauncher, ProcessSupervisor, SupervisionSummary, WorkerLauncher, INTERNAL_WORKER_FLAG,
};
