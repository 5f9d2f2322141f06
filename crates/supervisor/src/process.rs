//! Supervised worker processes
//!
//! A `SupervisedWorker` pairs a child process with the stream of reports it
//! writes on stdout. The parent never blocks on a worker: liveness is a
//! `try_wait`, the fault slot is a `try_recv`, and termination is a kill
//! signal without a join.

use axonfleet_common::{FleetConfig, Result};
use axonfleet_proto::{Fault, WorkerReport};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};

/// How a child process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,

    /// Human-readable status
    pub description: String,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            description: status.to_string(),
        }
    }
}

/// Non-blocking control over a child process
pub trait ChildHandle: Send {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Exit status if the child has exited
    fn try_wait(&mut self) -> Result<Option<ExitInfo>>;

    /// Send a kill signal without waiting for the child to exit
    fn start_kill(&mut self) -> Result<()>;
}

impl ChildHandle for tokio::process::Child {
    fn id(&self) -> Option<u32> {
        tokio::process::Child::id(self)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(tokio::process::Child::try_wait(self)?.map(ExitInfo::from))
    }

    fn start_kill(&mut self) -> Result<()> {
        Ok(tokio::process::Child::start_kill(self)?)
    }
}

/// Forward protocol lines from a child's stdout into a report channel.
///
/// Lines that are not reports are logged and dropped. The channel closes
/// when the child closes its stdout.
pub fn spawn_report_reader<R>(worker: String, stdout: R) -> mpsc::UnboundedReceiver<WorkerReport>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match WorkerReport::from_line(&line) {
                    Ok(report) => {
                        if tx.send(report).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(worker = %worker, "Ignoring non-protocol output ({}): {}", e, line),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = %worker, "Failed to read worker output: {}", e);
                    break;
                }
            }
        }
        debug!(worker = %worker, "report stream closed");
    });

    rx
}

/// One-shot fault cell fed by a worker's report channel
#[derive(Debug)]
pub struct FaultSlot {
    reports: mpsc::UnboundedReceiver<WorkerReport>,
    fault: Option<Fault>,
    started: bool,
    completed: bool,
    closed: bool,
}

impl FaultSlot {
    pub fn new(reports: mpsc::UnboundedReceiver<WorkerReport>) -> Self {
        Self {
            reports,
            fault: None,
            started: false,
            completed: false,
            closed: false,
        }
    }

    /// Whether the worker reported `started`
    pub fn started(&self) -> bool {
        self.started
    }

    /// Whether the worker reported `completed`
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Whether the report stream has ended
    pub fn closed(&self) -> bool {
        self.closed
    }

    fn record(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Started { .. } => self.started = true,
            WorkerReport::Completed => self.completed = true,
            WorkerReport::Fault(fault) => {
                if self.fault.is_none() {
                    self.fault = Some(fault);
                }
            }
        }
    }

    /// Non-blocking check for a fault.
    ///
    /// The first fault seen is cached; once cached, the channel is not read
    /// again and every later call returns the same value.
    pub fn query(&mut self) -> Option<&Fault> {
        while self.fault.is_none() && !self.closed {
            match self.reports.try_recv() {
                Ok(report) => self.record(report),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.closed = true,
            }
        }
        self.fault.as_ref()
    }

    /// Wait at most `bound` for the report stream to end, so a fault written
    /// just before exit is not missed
    pub async fn settle(&mut self, bound: Duration) -> Option<&Fault> {
        if self.fault.is_none() && !self.closed {
            let drained = tokio::time::timeout(bound, async {
                while let Some(report) = self.reports.recv().await {
                    self.record(report);
                    if self.fault.is_some() {
                        return;
                    }
                }
                self.closed = true;
            })
            .await;

            if drained.is_err() {
                debug!("report stream still open after {:?}", bound);
            }
        }
        self.fault.as_ref()
    }
}

/// A child process running one worker configuration
pub struct SupervisedWorker<C: ChildHandle = tokio::process::Child> {
    index: usize,
    config: FleetConfig,
    child: C,
    slot: FaultSlot,
    exit: Option<ExitInfo>,
    reaped: bool,
}

impl<C: ChildHandle> SupervisedWorker<C> {
    pub fn new(index: usize, config: FleetConfig, child: C, reports: mpsc::UnboundedReceiver<WorkerReport>) -> Self {
        Self {
            index,
            config,
            child,
            slot: FaultSlot::new(reports),
            exit: None,
            reaped: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Display name, `worker-{index} ({identity})`
    pub fn name(&self) -> String {
        format!("worker-{} ({})", self.index, self.config.identity())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking, idempotent fault check
    pub fn query_fault(&mut self) -> Option<Fault> {
        self.slot.query().cloned()
    }

    /// Drain reports for at most `bound` after the child exited
    pub async fn settle(&mut self, bound: Duration) -> Option<Fault> {
        self.slot.settle(bound).await.cloned()
    }

    pub fn has_started(&mut self) -> bool {
        self.slot.query();
        self.slot.started()
    }

    /// Non-blocking liveness check; the exit status is cached once seen
    pub fn poll_exit(&mut self) -> Result<Option<ExitInfo>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit.clone())
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Mark a cleanly exited worker as done
    pub fn reap(&mut self) {
        self.reaped = true;
    }

    /// Kill without waiting. A worker that already exited is left alone.
    pub fn terminate(&mut self) {
        if self.reaped || self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            debug!(worker = %self.name(), "kill failed (already exited?): {}", e);
        }
        self.reaped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn started() -> WorkerReport {
        WorkerReport::Started {
            pid: 1,
            hotkey: "a".to_string(),
            port: 9000,
        }
    }

    #[test]
    fn test_query_is_idempotent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = FaultSlot::new(rx);
        assert!(slot.query().is_none());

        tx.send(started()).unwrap();
        tx.send(WorkerReport::fault("first", "trace one")).unwrap();
        tx.send(WorkerReport::fault("second", "trace two")).unwrap();

        let first = slot.query().cloned().unwrap();
        assert_eq!(first.trace, "trace one");
        assert!(slot.started());

        for _ in 0..5 {
            assert_eq!(slot.query(), Some(&first));
        }
    }

    #[test]
    fn test_query_tracks_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = FaultSlot::new(rx);
        tx.send(WorkerReport::Completed).unwrap();
        drop(tx);

        assert!(slot.query().is_none());
        assert!(slot.completed());
        assert!(slot.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_catches_late_fault() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = FaultSlot::new(rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(WorkerReport::fault("late", "late trace")).unwrap();
        });

        assert!(slot.query().is_none());
        let fault = slot.settle(Duration::from_secs(1)).await.cloned();
        assert_eq!(fault.unwrap().error, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_is_bounded() {
        let (_tx, rx) = mpsc::unbounded_channel::<WorkerReport>();
        let mut slot = FaultSlot::new(rx);

        let start = tokio::time::Instant::now();
        assert!(slot.settle(Duration::from_millis(500)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(!slot.closed());
    }

    #[tokio::test]
    async fn test_report_reader_skips_noise() {
        let input = format!(
            "{}not a report\n{}",
            started().to_line().unwrap(),
            WorkerReport::fault("boom", "multi\nline").to_line().unwrap()
        );
        let mut rx = spawn_report_reader("worker-0".to_string(), std::io::Cursor::new(input.into_bytes()));

        assert_eq!(rx.recv().await, Some(started()));
        match rx.recv().await {
            Some(WorkerReport::Fault(fault)) => assert_eq!(fault.trace, "multi\nline"),
            other => panic!("Expected Fault, got {:?}", other),
        }
        assert_eq!(rx.recv().await, None);
    }
}
