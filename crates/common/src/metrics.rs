//! Metrics collection for AxonFleet
//!
//! This module provides Prometheus metrics for the supervisor and for the
//! weight synchronization loop running inside every worker.

use lazy_static::lazy_static;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for AxonFleet
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub supervisor: SupervisorMetrics,
    pub sync: SyncMetrics,
}

/// Process supervision metrics
#[derive(Debug, Clone)]
pub struct SupervisorMetrics {
    /// Worker processes spawned
    pub workers_spawned: IntCounter,

    /// Worker processes currently alive and supervised
    pub workers_active: IntGauge,

    /// Worker processes that exited cleanly
    pub workers_completed: IntCounter,

    /// Worker faults observed
    pub worker_faults: IntCounter,

    /// Siblings terminated during fault escalation
    pub workers_terminated: IntCounter,
}

/// Weight synchronization metrics
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    /// Successful local steps
    pub local_steps_total: IntCounter,

    /// Local steps that failed and were skipped
    pub step_failures_total: IntCounter,

    /// Completed publish/pull cycles
    pub publishes_total: IntCounter,

    /// Failed publish/pull attempts
    pub publish_failures_total: IntCounter,

    /// Publish/pull cycle duration
    pub publish_duration: Histogram,

    /// Best local loss seen so far
    pub best_loss: Gauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let supervisor = SupervisorMetrics {
            workers_spawned: counter(
                &registry,
                "supervisor_workers_spawned_total",
                "Total number of worker processes spawned",
            ),
            workers_active: gauge(
                &registry,
                "supervisor_workers_active",
                "Current number of supervised worker processes",
            ),
            workers_completed: counter(
                &registry,
                "supervisor_workers_completed_total",
                "Total number of worker processes that exited cleanly",
            ),
            worker_faults: counter(
                &registry,
                "supervisor_worker_faults_total",
                "Total number of worker faults observed",
            ),
            workers_terminated: counter(
                &registry,
                "supervisor_workers_terminated_total",
                "Total number of workers terminated during fault escalation",
            ),
        };

        let publish_duration = Histogram::with_opts(
            HistogramOpts::new(
                "sync_publish_duration_seconds",
                "Publish/pull cycle duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 12.0, 30.0]),
        )
        .expect("valid histogram definition");
        registry
            .register(Box::new(publish_duration.clone()))
            .expect("histogram registered once");

        let best_loss = Gauge::new("sync_best_loss", "Best local loss seen so far")
            .expect("valid gauge definition");
        registry
            .register(Box::new(best_loss.clone()))
            .expect("gauge registered once");

        let sync = SyncMetrics {
            local_steps_total: counter(
                &registry,
                "sync_local_steps_total",
                "Total number of successful local steps",
            ),
            step_failures_total: counter(
                &registry,
                "sync_step_failures_total",
                "Total number of local steps that failed and were skipped",
            ),
            publishes_total: counter(
                &registry,
                "sync_publishes_total",
                "Total number of completed publish/pull cycles",
            ),
            publish_failures_total: counter(
                &registry,
                "sync_publish_failures_total",
                "Total number of failed publish/pull attempts",
            ),
            publish_duration,
            best_loss,
        };

        MetricsRegistry {
            registry,
            supervisor,
            sync,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.supervisor.workers_spawned.inc();
        metrics.supervisor.workers_active.set(3);
        metrics.sync.publishes_total.inc();
        metrics.sync.best_loss.set(1.25);

        let output = metrics.gather();
        assert!(output.contains("supervisor_workers_spawned_total"));
        assert!(output.contains("supervisor_workers_active 3"));
        assert!(output.contains("sync_publishes_total 1"));
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new();
        let value = metrics.sync.publish_duration.time(|| 7);
        assert_eq!(value, 7);
        assert_eq!(metrics.sync.publish_duration.get_sample_count(), 1);
    }
}
