//! Weight synchronization loop
//!
//! Each local step folds the batch's weight rows into a running row with an
//! exponential moving average and renormalizes it. Every `sync_interval`
//! successful steps the row is published to the metagraph, the shared state
//! is pulled back, and the refreshed priority column goes to the axon.
//!
//! Failed steps leave the step counter untouched, so the publish cadence
//! counts successful steps only.

use crate::axon::Axon;
use crate::metagraph::Metagraph;
use crate::weights::WeightVector;
use axonfleet_common::config::NeuronConfig;
use axonfleet_common::metrics::LatencyTimer;
use axonfleet_common::{FleetError, Result, METRICS};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Synchronizer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Accumulating,
    Publishing,
}

/// Tunables, taken from the neuron configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub sync_interval: u64,
    pub smoothing: f32,
    pub retries: u32,
    pub retry_backoff: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &NeuronConfig) -> Self {
        Self {
            sync_interval: config.sync_interval.max(1),
            smoothing: config.smoothing,
            retries: config.sync_retries,
            retry_backoff: Duration::from_millis(config.sync_retry_backoff_ms),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&NeuronConfig::default())
    }
}

/// What a successful step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// Step index that just completed
    pub global_step: u64,

    /// Whether this step ended with a publish/pull cycle
    pub published: bool,
}

/// Running row state for one worker
#[derive(Debug, Clone)]
pub struct WeightSynchronizer {
    settings: SyncSettings,
    state: SyncState,
    row: WeightVector,
    uid: usize,
    global_step: u64,
    publishes: u64,
}

impl WeightSynchronizer {
    /// Pull the shared state and seed the running row from `W[uid, :]`.
    ///
    /// `global_step` carries the step count across epochs.
    pub fn start(metagraph: &mut dyn Metagraph, settings: SyncSettings, global_step: u64) -> Result<Self> {
        metagraph.sync()?;
        let (uid, row) = own_row(metagraph)?;
        debug!(uid, width = row.len(), global_step, "synchronizer started");

        Ok(Self {
            settings,
            state: SyncState::Accumulating,
            row,
            uid,
            global_step,
            publishes: 0,
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn row(&self) -> &WeightVector {
        &self.row
    }

    /// Number of peers the row covers
    pub fn width(&self) -> usize {
        self.row.len()
    }

    pub fn uid(&self) -> usize {
        self.uid
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Publishes completed by this synchronizer
    pub fn publishes(&self) -> u64 {
        self.publishes
    }

    /// Fold one batch of weight rows into the running row
    pub fn accumulate(&mut self, contribution: &[Vec<f32>]) -> Result<()> {
        let mean = WeightVector::batch_mean(contribution, self.row.len())?;
        self.row.smooth_toward(&mean, self.settings.smoothing)?;
        self.row.normalize_l1();
        Ok(())
    }

    /// Accumulate, publish when the cadence is due, then advance the counter.
    ///
    /// A contribution error leaves the counter and the row untouched and is
    /// returned as-is. A publish that still fails after all retries returns
    /// `FleetError::Sync`.
    pub fn step(
        &mut self,
        contribution: &[Vec<f32>],
        metagraph: &mut dyn Metagraph,
        axon: &mut dyn Axon,
    ) -> Result<StepOutcome> {
        let previous = self.row.clone();
        if let Err(e) = self.accumulate(contribution) {
            self.row = previous;
            return Err(e);
        }

        let published = (self.global_step + 1) % self.settings.sync_interval == 0;
        if published {
            self.publish_with_retry(metagraph, axon)?;
        }

        let outcome = StepOutcome {
            global_step: self.global_step,
            published,
        };
        self.global_step += 1;
        METRICS.sync.local_steps_total.inc();
        Ok(outcome)
    }

    /// One publish/pull cycle
    pub fn publish(&mut self, metagraph: &mut dyn Metagraph, axon: &mut dyn Axon) -> Result<()> {
        self.state = SyncState::Publishing;
        let result = METRICS
            .sync
            .publish_duration
            .time(|| self.publish_inner(metagraph, axon));
        self.state = SyncState::Accumulating;
        result
    }

    fn publish_inner(&mut self, metagraph: &mut dyn Metagraph, axon: &mut dyn Axon) -> Result<()> {
        metagraph.emit(&self.row, true)?;
        metagraph.sync()?;

        let (uid, row) = own_row(metagraph)?;
        let priorities = metagraph
            .weights()
            .column(uid)
            .ok_or_else(|| FleetError::metagraph(format!("no column for uid {}", uid)))?;
        axon.set_priority(metagraph.neurons(), &priorities)?;

        self.uid = uid;
        self.row = row;
        Ok(())
    }

    fn publish_with_retry(&mut self, metagraph: &mut dyn Metagraph, axon: &mut dyn Axon) -> Result<()> {
        let attempts = self.settings.retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.publish(metagraph, axon) {
                Ok(()) => {
                    self.publishes += 1;
                    METRICS.sync.publishes_total.inc();
                    info!(
                        step = self.global_step,
                        uid = self.uid,
                        peers = self.row.len(),
                        "Published weights"
                    );
                    return Ok(());
                }
                Err(e) => {
                    METRICS.sync.publish_failures_total.inc();
                    warn!(attempt, attempts, error = %e, "Weight publish failed");
                    last_error = Some(e);
                    if attempt < attempts && !self.settings.retry_backoff.is_zero() {
                        std::thread::sleep(self.settings.retry_backoff);
                    }
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(FleetError::sync(format!(
            "publish at step {} failed after {} attempts: {}",
            self.global_step, attempts, cause
        )))
    }
}

/// This worker's uid and row in the local snapshot
fn own_row(metagraph: &dyn Metagraph) -> Result<(usize, WeightVector)> {
    let uid = metagraph.own_uid().ok_or_else(|| {
        FleetError::metagraph(format!("hotkey {} is not registered", metagraph.hotkey()))
    })?;
    let row = metagraph
        .weights()
        .row(uid)
        .ok_or_else(|| FleetError::metagraph(format!("no row for uid {}", uid)))?;
    Ok((uid, row))
}
