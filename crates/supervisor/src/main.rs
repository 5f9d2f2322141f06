//! AxonFleet - Main Entry Point
//!
//! Without shared keys the configured identity is served in this process.
//! With shared keys every identity gets its own worker process, started by
//! re-executing this binary with `--internal-worker`.

use axonfleet_common::config::CONFIG_ENV;
use axonfleet_common::logging::{self, LogTarget};
use axonfleet_common::{FleetConfig, METRICS};
use axonfleet_supervisor::{fan_out, ProcessLauncher, ProcessSupervisor, INTERNAL_WORKER_FLAG};
use axonfleet_worker::fault::run_reported;
use axonfleet_worker::model::Device;
use axonfleet_worker::neuron::{ensure_parameters, serve};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use uuid::Uuid;

/// Exit code of a worker whose configuration could not be loaded
const EXIT_BAD_CONFIG: i32 = 2;

/// Exit code after Ctrl-C, in either mode
const EXIT_INTERRUPTED: i32 = 130;

fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("configs/fleet.yaml"))
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == INTERNAL_WORKER_FLAG) {
        std::process::exit(worker_main());
    }
    supervisor_main()
}

/// Worker mode: serve one identity and report the outcome on stdout
fn worker_main() -> i32 {
    let config = match FleetConfig::from_file(config_path()) {
        Ok(config) => config,
        Err(e) => {
            logging::init(None, LogTarget::Stderr);
            // Exiting before `started` tells the supervisor startup failed.
            error!("Failed to load worker config: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };
    logging::init(Some(&config), LogTarget::Stderr);

    info!("Starting worker for {}", config.identity());
    run_reported(&config, serve)
}

#[tokio::main]
async fn supervisor_main() -> anyhow::Result<()> {
    let path = config_path();
    let config = match FleetConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            logging::init(None, LogTarget::Stderr);
            return Err(e.into());
        }
    };
    logging::init(Some(&config), LogTarget::Stderr);

    info!("Starting AxonFleet with {}", path.display());

    let configs = fan_out(&config)?;

    // Device and shared parameters are settled once, before any worker runs.
    let device = Device::parse(&config.neuron.device)?;
    let parameters = ensure_parameters(&config)?;
    info!(
        "Shared parameters at {}, device {}",
        parameters.display(),
        device
    );

    let dump_metrics = config
        .observability
        .as_ref()
        .map(|o| o.enable_metrics)
        .unwrap_or(false);

    let result = if config.is_shared() {
        supervise(&config, configs).await
    } else {
        serve_in_process(config).await
    };

    if dump_metrics {
        info!("Final metrics:\n{}", METRICS.gather());
    }

    result
}

async fn serve_in_process(config: FleetConfig) -> anyhow::Result<()> {
    info!("Serving {} in-process", config.identity());
    let handle = tokio::task::spawn_blocking(move || serve(&config));

    tokio::select! {
        _ = signal::ctrl_c() => {
            // The blocking serve loop cannot be cancelled; leave without it.
            info!("Received shutdown signal");
            std::process::exit(EXIT_INTERRUPTED);
        }
        joined = handle => {
            let summary = joined??;
            info!(
                "Serving finished: {} epochs, {} steps, {} publishes",
                summary.epochs, summary.global_step, summary.publishes
            );
            Ok(())
        }
    }
}

async fn supervise(config: &FleetConfig, configs: Vec<FleetConfig>) -> anyhow::Result<()> {
    let run_id = Uuid::new_v4();
    let mut launcher = ProcessLauncher::new(&config.run_dir(), run_id)?;
    info!(
        "Run {}: launching {} workers, configs in {}",
        run_id,
        configs.len(),
        launcher.run_dir().display()
    );

    let mut supervisor = ProcessSupervisor::launch(
        run_id,
        configs,
        &mut launcher,
        config.poll_interval(),
        config.settle_timeout(),
    )?;

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => None,
        result = supervisor.run() => Some(result),
    };

    match outcome {
        None => {
            info!("Received shutdown signal");
            supervisor.terminate_all(None);
            std::process::exit(EXIT_INTERRUPTED);
        }
        Some(result) => {
            let summary = result?;
            info!("Run {} finished: {} workers completed", summary.run_id, summary.workers);
            Ok(())
        }
    }
}
