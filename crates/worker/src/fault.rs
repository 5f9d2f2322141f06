//! Child-side fault reporting
//!
//! A worker process runs its serving function through `run_reported`, which
//! speaks the report protocol on stdout: `started` first, then exactly one of
//! `completed` or `fault`. Panics are caught and reported like errors; the
//! panic hook records the location and backtrace before unwinding starts.

use axonfleet_common::FleetConfig;
use axonfleet_proto::WorkerReport;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use tracing::{error, info};

/// Exit code of a worker that completed
pub const EXIT_COMPLETED: i32 = 0;

/// Exit code of a worker that reported a fault
pub const EXIT_FAULT: i32 = 1;

lazy_static! {
    /// Location and backtrace of the most recent panic on any thread
    static ref LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);
}

static PANIC_HOOK: Once = Once::new();

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let backtrace = Backtrace::force_capture();
            *LAST_PANIC.lock() = Some(format!("panicked at {}\n\nBacktrace:\n{}", location, backtrace));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Render an error with its source chain and a backtrace, if one is enabled
pub fn render_trace(err: &(dyn std::error::Error + 'static)) -> String {
    let mut trace = err.to_string();

    let mut source = err.source();
    if source.is_some() {
        trace.push_str("\n\nCaused by:");
    }
    let mut depth = 0;
    while let Some(cause) = source {
        trace.push_str(&format!("\n    {}: {}", depth, cause));
        depth += 1;
        source = cause.source();
    }

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        trace.push_str(&format!("\n\nBacktrace:\n{}", backtrace));
    }
    trace
}

fn write_report<W: Write>(out: &mut W, report: &WorkerReport) {
    let line = match report.to_line() {
        Ok(line) => line,
        Err(e) => {
            error!("Failed to encode report: {}", e);
            return;
        }
    };
    // Nothing to fall back to if the pipe is gone; the supervisor sees the
    // exit status instead.
    if let Err(e) = out.write_all(line.as_bytes()).and_then(|_| out.flush()) {
        error!("Failed to write report: {}", e);
    }
}

/// Run `serve` under the report protocol, writing reports to `out`.
///
/// Returns the exit code the process should terminate with.
pub fn run_reported_with<W, F, T, E>(out: &mut W, config: &FleetConfig, serve: F) -> i32
where
    W: Write,
    F: FnOnce(&FleetConfig) -> std::result::Result<T, E>,
    E: std::error::Error + 'static,
{
    install_panic_hook();

    write_report(
        out,
        &WorkerReport::Started {
            pid: std::process::id(),
            hotkey: config.wallet.hotkey.clone(),
            port: config.axon.port,
        },
    );

    let report = match panic::catch_unwind(AssertUnwindSafe(|| serve(config))) {
        Ok(Ok(_)) => {
            info!(identity = %config.identity(), "Worker completed");
            WorkerReport::Completed
        }
        Ok(Err(e)) => {
            error!(identity = %config.identity(), error = %e, "Worker failed");
            WorkerReport::fault(e.to_string(), render_trace(&e))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let details = LAST_PANIC.lock().take().unwrap_or_default();
            error!(identity = %config.identity(), "Worker panicked: {}", message);
            WorkerReport::fault(message.clone(), format!("{}\n{}", message, details))
        }
    };

    let code = match report {
        WorkerReport::Completed => EXIT_COMPLETED,
        _ => EXIT_FAULT,
    };
    write_report(out, &report);
    code
}

/// Run `serve` under the report protocol on stdout
pub fn run_reported<F, T, E>(config: &FleetConfig, serve: F) -> i32
where
    F: FnOnce(&FleetConfig) -> std::result::Result<T, E>,
    E: std::error::Error + 'static,
{
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_reported_with(&mut out, config, serve)
}
