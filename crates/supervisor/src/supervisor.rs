//! Process supervision
//!
//! One worker process per identity. The supervisor polls every worker on a
//! fixed interval. The first fault it sees wins: every sibling is killed and
//! the fault's trace is returned as a single `ChildProcess` error. The run
//! succeeds only when every worker exits cleanly.

use crate::process::{spawn_report_reader, ChildHandle, ExitInfo, SupervisedWorker};
use axonfleet_common::config::{CONFIG_ENV, ENV_PREFIX};
use axonfleet_common::metrics::SupervisorMetrics;
use axonfleet_common::{FleetConfig, FleetError, Result, METRICS};
use axonfleet_proto::{Fault, WorkerReport};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Command-line flag that switches the binary into worker mode
pub const INTERNAL_WORKER_FLAG: &str = "--internal-worker";

/// Starts worker processes
pub trait WorkerLauncher {
    type Child: ChildHandle;

    /// Start worker `index` for `config`, returning its handle and report stream
    fn launch(
        &mut self,
        index: usize,
        config: &FleetConfig,
    ) -> Result<(Self::Child, mpsc::UnboundedReceiver<WorkerReport>)>;
}

/// Launches workers by re-executing a binary in worker mode.
///
/// Each worker's configuration is written to `{run_dir}/{run_id}/worker-{index}.yaml`
/// and passed through `AXONFLEET_CONFIG`.
pub struct ProcessLauncher {
    executable: PathBuf,
    run_dir: PathBuf,
}

impl ProcessLauncher {
    /// Launch workers from the current executable
    pub fn new(run_dir: &Path, run_id: Uuid) -> Result<Self> {
        let executable = std::env::current_exe()
            .map_err(|e| FleetError::worker_startup(format!("Failed to get current executable: {}", e)))?;
        Self::with_executable(executable, run_dir, run_id)
    }

    pub fn with_executable(executable: PathBuf, run_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = run_dir.join(run_id.to_string());
        std::fs::create_dir_all(&run_dir)?;
        Ok(Self { executable, run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Child = tokio::process::Child;

    fn launch(
        &mut self,
        index: usize,
        config: &FleetConfig,
    ) -> Result<(Self::Child, mpsc::UnboundedReceiver<WorkerReport>)> {
        let config_path = self.run_dir.join(format!("worker-{}.yaml", index));
        config.write_yaml(&config_path)?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg(INTERNAL_WORKER_FLAG)
            .env(CONFIG_ENV, &config_path)
            .env("RUST_LIB_BACKTRACE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Per-key overrides were applied before fan-out; re-applying them in
        // the worker could undo its identity.
        let prefix = format!("{}__", ENV_PREFIX);
        for (key, _) in std::env::vars() {
            if key.starts_with(&prefix) {
                cmd.env_remove(key);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            FleetError::worker_startup(format!("Failed to spawn worker-{}: {}", index, e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::worker_startup("Child stdout not captured"))?;
        let reports = spawn_report_reader(format!("worker-{}", index), stdout);

        debug!(
            "Spawned worker-{} ({}) with PID {:?}",
            index,
            config.identity(),
            child.id()
        );
        Ok((child, reports))
    }
}

/// Result of a run in which every worker exited cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionSummary {
    pub run_id: Uuid,
    pub workers: usize,
}

/// Pool of worker processes
pub struct ProcessSupervisor<C: ChildHandle = tokio::process::Child> {
    run_id: Uuid,
    workers: Vec<SupervisedWorker<C>>,
    poll_interval: Duration,
    settle_timeout: Duration,
    metrics: SupervisorMetrics,
}

impl<C: ChildHandle> ProcessSupervisor<C> {
    /// Launch one worker per configuration.
    ///
    /// If launching worker k fails, workers 0..k are killed and a
    /// `WorkerStartup` error is returned.
    pub fn launch<L>(
        run_id: Uuid,
        configs: Vec<FleetConfig>,
        launcher: &mut L,
        poll_interval: Duration,
        settle_timeout: Duration,
    ) -> Result<Self>
    where
        L: WorkerLauncher<Child = C>,
    {
        Self::launch_with_metrics(
            run_id,
            configs,
            launcher,
            poll_interval,
            settle_timeout,
            METRICS.supervisor.clone(),
        )
    }

    /// Like `launch`, recording into `metrics` instead of the global registry
    pub fn launch_with_metrics<L>(
        run_id: Uuid,
        configs: Vec<FleetConfig>,
        launcher: &mut L,
        poll_interval: Duration,
        settle_timeout: Duration,
        metrics: SupervisorMetrics,
    ) -> Result<Self>
    where
        L: WorkerLauncher<Child = C>,
    {
        let mut supervisor = Self {
            run_id,
            workers: Vec::with_capacity(configs.len()),
            poll_interval,
            settle_timeout,
            metrics,
        };

        for (index, config) in configs.into_iter().enumerate() {
            match launcher.launch(index, &config) {
                Ok((child, reports)) => {
                    let worker = SupervisedWorker::new(index, config, child, reports);
                    info!("Launched {} (pid {:?})", worker.name(), worker.pid());
                    supervisor.metrics.workers_spawned.inc();
                    supervisor.metrics.workers_active.inc();
                    supervisor.workers.push(worker);
                }
                Err(e) => {
                    error!("Failed to launch worker-{}: {}", index, e);
                    supervisor.terminate_all(None);
                    return Err(match e {
                        FleetError::WorkerStartup(_) => e,
                        other => FleetError::worker_startup(format!("worker-{}: {}", index, other)),
                    });
                }
            }
        }

        Ok(supervisor)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workers(&self) -> &[SupervisedWorker<C>] {
        &self.workers
    }

    /// Workers still supervised
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_reaped()).count()
    }

    /// Poll until every worker exited cleanly or one of them failed
    pub async fn run(&mut self) -> Result<SupervisionSummary> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            for index in 0..self.workers.len() {
                if self.workers[index].is_reaped() {
                    continue;
                }
                if let Err(e) = self.check(index).await {
                    // The failed worker leaves supervision here; its siblings
                    // are accounted for by `terminate_all`.
                    self.metrics.worker_faults.inc();
                    self.metrics.workers_active.dec();
                    self.terminate_all(Some(index));
                    return Err(e);
                }
            }

            if self.live_workers() == 0 {
                info!("All {} workers completed", self.workers.len());
                return Ok(SupervisionSummary {
                    run_id: self.run_id,
                    workers: self.workers.len(),
                });
            }
        }
    }

    /// Inspect one worker; returns the error that should end the run
    async fn check(&mut self, index: usize) -> Result<()> {
        let settle_timeout = self.settle_timeout;
        let worker = &mut self.workers[index];

        if let Some(fault) = worker.query_fault() {
            return Err(escalate(worker.name(), fault));
        }

        let exit = match worker.poll_exit()? {
            None => return Ok(()),
            Some(exit) => exit,
        };

        if let Some(fault) = worker.settle(settle_timeout).await {
            return Err(escalate(worker.name(), fault));
        }

        if exit.success() {
            info!("{} exited cleanly", worker.name());
            worker.reap();
            self.metrics.workers_completed.inc();
            self.metrics.workers_active.dec();
            return Ok(());
        }

        if !worker.has_started() {
            error!("{} exited before starting: {}", worker.name(), exit.description);
            return Err(FleetError::worker_startup(format!(
                "{}: not started and not exited ({})",
                worker.name(),
                exit.description
            )));
        }

        error!("{} died without a fault report: {}", worker.name(), exit.description);
        Err(FleetError::child_process(worker.name(), synthesized_trace(&exit)))
    }

    /// Kill every worker still supervised, except `except`. Does not wait.
    pub fn terminate_all(&mut self, except: Option<usize>) {
        for worker in self.workers.iter_mut() {
            if Some(worker.index()) == except || worker.is_reaped() {
                continue;
            }
            warn!("Terminating {}", worker.name());
            worker.terminate();
            self.metrics.workers_terminated.inc();
            self.metrics.workers_active.dec();
        }
    }
}

fn escalate(worker: String, fault: Fault) -> FleetError {
    error!("{} faulted: {}", worker, fault.error);
    FleetError::child_process(worker, fault.trace)
}

fn synthesized_trace(exit: &ExitInfo) -> String {
    format!(
        "worker process terminated with {} without reporting a fault",
        exit.description
    )
}
