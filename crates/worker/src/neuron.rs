//! Serving loop for one identity
//!
//! Epochs run back to back until `neuron.max_epochs` (forever when unset).
//! Each epoch takes `neuron.local_epochs` successful local steps; a step
//! that fails with a transient error is logged and retried with the next
//! batch. After each epoch the learning rate schedule advances and the model
//! is checkpointed if its loss improved.

use crate::axon::{Axon, PriorityAxon};
use crate::batching::{BatchSource, SyntheticCorpus};
use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::metagraph::{self, Metagraph};
use crate::model::{Device, Model, PeerScoringModel};
use crate::params::SharedParameters;
use crate::schedule::WarmupCosineSchedule;
use crate::synchronizer::{SyncSettings, WeightSynchronizer};
use axonfleet_common::{FleetConfig, FleetError, Result, METRICS};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consecutive transient failures after which a worker gives up
pub const MAX_CONSECUTIVE_STEP_FAILURES: u32 = 1000;

/// Outcome of one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: u64,
    pub global_step: u64,
    pub loss: f32,
    pub learning_rate: f32,
    pub publishes: u64,
    pub step_failures: u64,
    pub checkpointed: bool,
}

/// Totals over a bounded run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeuronSummary {
    pub epochs: u64,
    pub global_step: u64,
    pub publishes: u64,
    pub step_failures: u64,
    pub checkpoints: u64,
    pub best_loss: Option<f32>,
}

/// One serving identity and its collaborators
pub struct Neuron {
    config: FleetConfig,
    model: Box<dyn Model>,
    metagraph: Box<dyn Metagraph>,
    axon: Box<dyn Axon>,
    batches: Box<dyn BatchSource>,
    schedule: WarmupCosineSchedule,
    checkpointer: Checkpointer,
    settings: SyncSettings,
    peers: usize,
    global_step: u64,
    epoch: u64,
}

impl Neuron {
    /// Validate the configuration, create the working directory and register
    /// the identity with the metagraph
    pub fn new(
        mut config: FleetConfig,
        mut model: Box<dyn Model>,
        mut metagraph: Box<dyn Metagraph>,
        axon: Box<dyn Axon>,
        batches: Box<dyn BatchSource>,
    ) -> Result<Self> {
        let full_path = config.check()?;
        if config.neuron.trial_id.is_none() {
            config.neuron.trial_id = Some(Uuid::new_v4().to_string());
        }
        model.to_device(Device::parse(&config.neuron.device)?)?;

        let uid = metagraph.register()?;
        info!(
            hotkey = %config.wallet.hotkey,
            uid,
            path = %full_path.display(),
            "Neuron registered"
        );

        let schedule = WarmupCosineSchedule::serving(config.neuron.learning_rate);
        let settings = SyncSettings::from_config(&config.neuron);

        Ok(Self {
            checkpointer: Checkpointer::new(&full_path),
            model,
            metagraph,
            axon,
            batches,
            schedule,
            settings,
            peers: 0,
            global_step: 0,
            epoch: 0,
            config,
        })
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpointer.path().to_path_buf()
    }

    /// Run epochs until `neuron.max_epochs`
    pub fn run(&mut self) -> Result<NeuronSummary> {
        let mut summary = NeuronSummary::default();

        loop {
            if let Some(max) = self.config.neuron.max_epochs {
                if self.epoch >= max {
                    break;
                }
            }

            let report = self.run_epoch()?;
            summary.epochs += 1;
            summary.global_step = report.global_step;
            summary.publishes += report.publishes;
            summary.step_failures += report.step_failures;
            if report.checkpointed {
                summary.checkpoints += 1;
            }
        }

        let best = self.checkpointer.best_loss();
        summary.best_loss = best.is_finite().then_some(best);
        info!(
            hotkey = %self.config.wallet.hotkey,
            epochs = summary.epochs,
            steps = summary.global_step,
            publishes = summary.publishes,
            "Neuron finished"
        );
        Ok(summary)
    }

    /// One training epoch
    pub fn run_epoch(&mut self) -> Result<EpochReport> {
        let hotkey = self.config.wallet.hotkey.clone();
        let local_epochs = self.config.neuron.local_epochs;
        let log_interval = self.config.neuron.log_interval.max(1);

        self.model.train();
        let mut sync = WeightSynchronizer::start(self.metagraph.as_mut(), self.settings.clone(), self.global_step)?;

        let mut completed = 0u64;
        let mut failures = 0u64;
        let mut consecutive = 0u32;
        let mut loss = f32::INFINITY;

        while completed < local_epochs {
            let step = self.batches.next_batch().and_then(|batch| {
                let width = sync.width();
                if width != self.peers {
                    self.model.resize_peers(width)?;
                    self.peers = width;
                }
                let output = self.model.forward(&batch, true, true)?;
                let outcome = sync.step(&output.weights, self.metagraph.as_mut(), self.axon.as_mut())?;
                Ok((output, outcome))
            });

            match step {
                Ok((output, outcome)) => {
                    completed += 1;
                    consecutive = 0;
                    loss = output.local_loss;

                    debug!(
                        hotkey = %hotkey,
                        step = outcome.global_step,
                        local_loss = output.local_loss,
                        remote_loss = output.remote_loss,
                        distillation_loss = output.distillation_loss,
                        "local step"
                    );
                    if (outcome.global_step + 1) % log_interval == 0 {
                        info!(
                            "hotkey: {}, epoch: {}, step: {}, loss: {:.4}, lr: {:.6}",
                            hotkey,
                            self.epoch + 1,
                            outcome.global_step,
                            output.local_loss,
                            self.model.learning_rate()
                        );
                    }
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    consecutive += 1;
                    METRICS.sync.step_failures_total.inc();
                    warn!(hotkey = %hotkey, error = %e, "Local step failed, skipping batch");

                    if consecutive >= MAX_CONSECUTIVE_STEP_FAILURES {
                        return Err(FleetError::Internal(format!(
                            "{} consecutive local steps failed, last error: {}",
                            consecutive, e
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.global_step = sync.global_step();
        self.epoch += 1;

        let learning_rate = self.schedule.step();
        self.model.set_learning_rate(learning_rate);

        let checkpoint = Checkpoint {
            epoch: self.epoch,
            global_step: self.global_step,
            loss,
            trial_id: self.config.neuron.trial_id.clone(),
            state: self.model.state_dict()?,
        };
        let checkpointed = self.checkpointer.save_if_better(&checkpoint)?;
        if checkpointed {
            METRICS.sync.best_loss.set(loss as f64);
        }

        Ok(EpochReport {
            epoch: self.epoch,
            global_step: self.global_step,
            loss,
            learning_rate,
            publishes: sync.publishes(),
            step_failures: failures,
            checkpointed,
        })
    }
}

/// Export the shared parameter table unless it already exists
pub fn ensure_parameters(config: &FleetConfig) -> Result<PathBuf> {
    let path = config.parameters_path();
    if !path.exists() {
        SharedParameters::export(&path, config.model.vocab_size, config.model.embedding_dim, config.model.seed)?;
    }
    Ok(path)
}

/// Build the reference collaborators for `config` and run its serving loop
pub fn serve(config: &FleetConfig) -> Result<NeuronSummary> {
    let parameters = Arc::new(SharedParameters::open(ensure_parameters(config)?)?);
    if parameters.rows() != config.model.vocab_size || parameters.cols() != config.model.embedding_dim {
        return Err(FleetError::config(format!(
            "shared parameters are {}x{} but the model expects {}x{}",
            parameters.rows(),
            parameters.cols(),
            config.model.vocab_size,
            config.model.embedding_dim
        )));
    }

    let metagraph = metagraph::open(&config.metagraph, &config.wallet.hotkey)?;
    let axon = PriorityAxon::new(&config.axon)?;
    let model = PeerScoringModel::new(
        parameters,
        1,
        config.neuron.learning_rate,
        config.neuron.momentum,
        config.model.seed,
    );
    let corpus = SyntheticCorpus::new(
        config.model.vocab_size,
        config.neuron.batch_size_train,
        config.neuron.sequence_length,
        config.model.seed ^ u64::from(config.axon.port),
    )?;

    info!(
        "Serving {} on {} (device {})",
        config.identity(),
        config.endpoint(),
        config.neuron.device
    );

    let mut neuron = Neuron::new(
        config.clone(),
        Box::new(model),
        metagraph,
        Box::new(axon),
        Box::new(corpus),
    )?;
    neuron.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metagraph::InMemoryMetagraph;
    use crate::model::{Batch, ForwardOutput, ParameterView};
    use axonfleet_common::config::MetagraphBackend;
    use std::collections::VecDeque;

    fn test_config(dir: &std::path::Path) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.neuron.datapath = dir.to_path_buf();
        config.neuron.sync_retry_backoff_ms = 0;
        config.model.vocab_size = 32;
        config.model.embedding_dim = 4;
        config.axon.reserve_port = false;
        config.metagraph.backend = MetagraphBackend::Memory;
        config
    }

    /// Model returning scripted losses; `None` entries fail the step
    struct ScriptedModel {
        losses: VecDeque<Option<f32>>,
        width: usize,
        learning_rate: f32,
    }

    impl ScriptedModel {
        fn new(losses: Vec<Option<f32>>) -> Self {
            Self {
                losses: losses.into(),
                width: 1,
                learning_rate: 0.0,
            }
        }
    }

    impl Model for ScriptedModel {
        fn forward(&mut self, batch: &Batch, _training: bool, _remote: bool) -> Result<ForwardOutput> {
            match self.losses.pop_front().unwrap_or(Some(1.0)) {
                Some(loss) => Ok(ForwardOutput {
                    local_loss: loss,
                    remote_loss: loss,
                    distillation_loss: 0.0,
                    weights: vec![vec![1.0; self.width]; batch.len()],
                }),
                None => Err(FleetError::model("scripted failure")),
            }
        }
        fn parameters(&self) -> Vec<ParameterView<'_>> {
            Vec::new()
        }
        fn state_dict(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        fn to_device(&mut self, _device: Device) -> Result<()> {
            Ok(())
        }
        fn train(&mut self) {}
        fn eval(&mut self) {}
        fn learning_rate(&self) -> f32 {
            self.learning_rate
        }
        fn set_learning_rate(&mut self, lr: f32) {
            self.learning_rate = lr;
        }
        fn resize_peers(&mut self, n: usize) -> Result<()> {
            self.width = n;
            Ok(())
        }
    }

    fn neuron(config: FleetConfig, model: ScriptedModel) -> Neuron {
        let corpus = SyntheticCorpus::new(32, 2, 4, 1).unwrap();
        Neuron::new(
            config,
            Box::new(model),
            Box::new(InMemoryMetagraph::new("default")),
            Box::new(PriorityAxon::unbound()),
            Box::new(corpus),
        )
        .unwrap()
    }

    #[test]
    fn test_publish_cadence_spans_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.sync_interval = 100;
        config.neuron.local_epochs = 50;
        config.neuron.max_epochs = Some(5);

        let summary = neuron(config, ScriptedModel::new(Vec::new())).run().unwrap();
        assert_eq!(summary.epochs, 5);
        assert_eq!(summary.global_step, 250);
        assert_eq!(summary.publishes, 2);
    }

    #[test]
    fn test_transient_failures_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.sync_interval = 2;
        config.neuron.local_epochs = 4;
        config.neuron.max_epochs = Some(1);

        let model = ScriptedModel::new(vec![Some(1.0), None, None, Some(1.0), Some(1.0), None, Some(1.0)]);
        let summary = neuron(config, model).run().unwrap();
        assert_eq!(summary.global_step, 4);
        assert_eq!(summary.step_failures, 3);
        assert_eq!(summary.publishes, 2);
    }

    /// Corpus whose listed calls (0-based) fail with a transient error
    struct FlakyBatches {
        inner: SyntheticCorpus,
        calls: usize,
        failing: Vec<usize>,
    }

    impl BatchSource for FlakyBatches {
        fn next_batch(&mut self) -> Result<Batch> {
            let call = self.calls;
            self.calls += 1;
            if self.failing.contains(&call) {
                return Err(FleetError::invalid_input("corrupt batch"));
            }
            self.inner.next_batch()
        }
    }

    #[test]
    fn test_failed_batch_load_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.sync_interval = 2;
        config.neuron.local_epochs = 4;
        config.neuron.max_epochs = Some(1);

        let batches = FlakyBatches {
            inner: SyntheticCorpus::new(32, 2, 4, 1).unwrap(),
            calls: 0,
            failing: vec![1, 3],
        };
        let mut n = Neuron::new(
            config,
            Box::new(ScriptedModel::new(Vec::new())),
            Box::new(InMemoryMetagraph::new("default")),
            Box::new(PriorityAxon::unbound()),
            Box::new(batches),
        )
        .unwrap();

        let summary = n.run().unwrap();
        assert_eq!(summary.global_step, 4);
        assert_eq!(summary.step_failures, 2);
        assert_eq!(summary.publishes, 2);
    }

    #[test]
    fn test_checkpoint_on_strict_improvement_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.local_epochs = 1;
        config.neuron.max_epochs = Some(4);
        config.neuron.trial_id = Some("trial-7".to_string());

        let model = ScriptedModel::new(vec![Some(3.0), Some(2.0), Some(2.0), Some(1.0)]);
        let mut n = neuron(config.clone(), model);
        let summary = n.run().unwrap();
        assert_eq!(summary.checkpoints, 3);
        assert_eq!(summary.best_loss, Some(1.0));

        assert_eq!(n.checkpoint_path(), config.full_path().join("model.json"));
        let saved: Checkpoint =
            serde_json::from_slice(&std::fs::read(n.checkpoint_path()).unwrap()).unwrap();
        assert_eq!(saved.epoch, 4);
        assert_eq!(saved.trial_id.as_deref(), Some("trial-7"));
    }

    #[test]
    fn test_learning_rate_follows_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.local_epochs = 1;
        config.neuron.learning_rate = 0.5;

        let mut n = neuron(config, ScriptedModel::new(Vec::new()));
        let first = n.run_epoch().unwrap();
        assert!((first.learning_rate - 0.01).abs() < 1e-6);
        let second = n.run_epoch().unwrap();
        assert!((second.learning_rate - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_persistent_failure_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.max_epochs = Some(1);

        let model = ScriptedModel::new(vec![None; MAX_CONSECUTIVE_STEP_FAILURES as usize]);
        let err = neuron(config, model).run().unwrap_err();
        assert!(matches!(err, FleetError::Internal(_)));
    }

    #[test]
    fn test_serve_reference_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.local_epochs = 5;
        config.neuron.sync_interval = 3;
        config.neuron.max_epochs = Some(2);
        config.metagraph.backend = MetagraphBackend::File;
        config.metagraph.path = dir.path().join("metagraph.json");

        let summary = serve(&config).unwrap();
        assert_eq!(summary.global_step, 10);
        assert_eq!(summary.publishes, 3);
        assert!(config.parameters_path().exists());
        assert!(config.full_path().join("model.json").exists());
    }

    #[test]
    fn test_serve_rejects_mismatched_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.neuron.max_epochs = Some(0);
        SharedParameters::export(config.parameters_path(), 8, 4, 0).unwrap();

        assert!(matches!(serve(&config), Err(FleetError::Config(_))));
    }
}
