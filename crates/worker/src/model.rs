//! Model collaborator
//!
//! The serving loop only needs a model that turns a batch into losses and a
//! per-sequence weight row over the known peers. `PeerScoringModel` is the
//! reference implementation: a bag-of-embeddings encoder over the shared
//! memory-mapped table, a private next-token head and a private peer head.
//! Both heads are trained with SGD + momentum.

use crate::params::SharedParametersRef;
use axonfleet_common::{FleetError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Parse "cpu", "cuda" or "cuda:N"
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => {
                let ordinal = s
                    .strip_prefix("cuda:")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| FleetError::config(format!("unknown device '{}'", s)))?;
                Ok(Device::Cuda(ordinal))
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(n) => write!(f, "cuda:{}", n),
        }
    }
}

/// One training batch of token sequences
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub sequences: Vec<Vec<u32>>,
}

impl Batch {
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self { sequences }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Result of one forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput {
    /// Next-token loss of the local head
    pub local_loss: f32,

    /// Loss of the peer-routed path (zero when not requested)
    pub remote_loss: f32,

    /// Peer head regularization loss
    pub distillation_loss: f32,

    /// Per-sequence weight rows over the known peers
    pub weights: Vec<Vec<f32>>,
}

/// Named view of a trainable tensor
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterView<'a> {
    pub name: &'static str,
    pub shape: Vec<usize>,
    pub values: &'a [f32],
}

/// Interface the serving loop drives
pub trait Model: Send {
    /// Run one batch; updates trainable parameters when `training` is set and
    /// the model is in training mode
    fn forward(&mut self, batch: &Batch, training: bool, remote: bool) -> Result<ForwardOutput>;

    /// Trainable tensors
    fn parameters(&self) -> Vec<ParameterView<'_>>;

    /// Serializable snapshot of the trainable state
    fn state_dict(&self) -> Result<serde_json::Value>;

    /// Move to a compute device
    fn to_device(&mut self, device: Device) -> Result<()>;

    /// Switch to training mode
    fn train(&mut self);

    /// Switch to evaluation mode
    fn eval(&mut self);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);

    /// Resize the peer head to `n` peers, keeping existing rows
    fn resize_peers(&mut self, n: usize) -> Result<()>;
}

/// Serialized trainable state of `PeerScoringModel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub n_peers: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub steps: u64,
    pub token_head: Vec<f32>,
    pub token_bias: Vec<f32>,
    pub peer_head: Vec<f32>,
    pub peer_bias: Vec<f32>,
}

/// Dense `rows x cols` tensor with a momentum buffer
#[derive(Debug, Clone)]
struct Trainable {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
    velocity: Vec<f32>,
}

impl Trainable {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            values: vec![0.0; rows * cols],
            velocity: vec![0.0; rows * cols],
        }
    }

    fn random(rows: usize, cols: usize, scale: f32, rng: &mut StdRng) -> Self {
        let mut t = Self::zeros(rows, cols);
        for v in t.values.iter_mut() {
            *v = rng.random_range(-scale..scale);
        }
        t
    }

    /// `out = self * h` (self is `rows x cols`, h has `cols` entries)
    fn matvec(&self, h: &[f32], bias: &Trainable) -> Vec<f32> {
        (0..self.rows)
            .map(|r| {
                let row = &self.values[r * self.cols..(r + 1) * self.cols];
                row.iter().zip(h).map(|(w, x)| w * x).sum::<f32>() + bias.values[r]
            })
            .collect()
    }

    /// SGD with momentum: `v = m * v + g; w -= lr * v`
    fn apply(&mut self, grad: &[f32], lr: f32, momentum: f32) {
        for ((w, v), g) in self.values.iter_mut().zip(self.velocity.iter_mut()).zip(grad) {
            *v = momentum * *v + g;
            *w -= lr * *v;
        }
    }

    fn grow_rows(&mut self, rows: usize) {
        if rows <= self.rows {
            return;
        }
        self.values.resize(rows * self.cols, 0.0);
        self.velocity.resize(rows * self.cols, 0.0);
        self.rows = rows;
    }
}

fn softmax_in_place(z: &mut [f32]) {
    let max = z.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in z.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in z.iter_mut() {
        *v /= sum;
    }
}

/// Reference model over shared embeddings
pub struct PeerScoringModel {
    embeddings: SharedParametersRef,
    token_head: Trainable,
    token_bias: Trainable,
    peer_head: Trainable,
    peer_bias: Trainable,
    learning_rate: f32,
    momentum: f32,
    device: Device,
    training: bool,
    steps: u64,
}

impl PeerScoringModel {
    /// Build a model over `embeddings` scoring `n_peers` peers
    pub fn new(embeddings: SharedParametersRef, n_peers: usize, learning_rate: f32, momentum: f32, seed: u64) -> Self {
        let vocab = embeddings.rows();
        let dim = embeddings.cols();
        let n_peers = n_peers.max(1);
        let scale = 1.0 / (dim as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);

        info!(
            "Model initialized: vocab={}, dim={}, peers={}, trainable={}",
            vocab,
            dim,
            n_peers,
            (vocab + n_peers) * (dim + 1)
        );

        Self {
            token_head: Trainable::random(vocab, dim, scale, &mut rng),
            token_bias: Trainable::zeros(vocab, 1),
            peer_head: Trainable::random(n_peers, dim, scale, &mut rng),
            peer_bias: Trainable::zeros(n_peers, 1),
            embeddings,
            learning_rate,
            momentum,
            device: Device::Cpu,
            training: false,
            steps: 0,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn n_peers(&self) -> usize {
        self.peer_head.rows
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Optimizer steps taken
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Mean embedding of `context`
    fn encode(&self, context: &[u32]) -> Result<Vec<f32>> {
        let mut h = vec![0.0; self.embeddings.cols()];
        for token in context {
            self.embeddings.accumulate_row(*token as usize, &mut h)?;
        }
        let n = context.len() as f32;
        for v in h.iter_mut() {
            *v /= n;
        }
        Ok(h)
    }
}

impl Model for PeerScoringModel {
    fn forward(&mut self, batch: &Batch, training: bool, remote: bool) -> Result<ForwardOutput> {
        if batch.is_empty() {
            return Err(FleetError::model("empty batch"));
        }

        let dim = self.embeddings.cols();
        let vocab = self.token_head.rows;
        let n_peers = self.peer_head.rows;
        let update = training && self.training;

        let mut grad_token = vec![0.0; vocab * dim];
        let mut grad_token_bias = vec![0.0; vocab];
        let mut grad_peer = vec![0.0; n_peers * dim];
        let mut grad_peer_bias = vec![0.0; n_peers];

        let mut local_loss = 0.0f32;
        let mut distillation_loss = 0.0f32;
        let mut weights = Vec::with_capacity(batch.len());

        for (i, sequence) in batch.sequences.iter().enumerate() {
            if sequence.len() < 2 {
                return Err(FleetError::model(format!(
                    "sequence {} has {} tokens, need at least 2",
                    i,
                    sequence.len()
                )));
            }
            let (context, target) = sequence.split_at(sequence.len() - 1);
            let target = target[0] as usize;
            if target >= vocab {
                return Err(FleetError::model(format!("target token {} outside vocabulary", target)));
            }
            let h = self.encode(context)?;

            // Next-token head
            let mut p = self.token_head.matvec(&h, &self.token_bias);
            softmax_in_place(&mut p);
            local_loss += -p[target].max(f32::MIN_POSITIVE).ln();

            // Peer head, pulled toward a uniform routing distribution
            let mut w = self.peer_head.matvec(&h, &self.peer_bias);
            softmax_in_place(&mut w);
            let uniform = 1.0 / n_peers as f32;
            distillation_loss += -w.iter().map(|v| v.max(f32::MIN_POSITIVE).ln()).sum::<f32>() * uniform;

            if update {
                for r in 0..vocab {
                    let dz = p[r] - if r == target { 1.0 } else { 0.0 };
                    grad_token_bias[r] += dz;
                    for (g, x) in grad_token[r * dim..(r + 1) * dim].iter_mut().zip(&h) {
                        *g += dz * x;
                    }
                }
                for r in 0..n_peers {
                    let dy = w[r] - uniform;
                    grad_peer_bias[r] += dy;
                    for (g, x) in grad_peer[r * dim..(r + 1) * dim].iter_mut().zip(&h) {
                        *g += dy * x;
                    }
                }
            }

            weights.push(w);
        }

        let n = batch.len() as f32;
        local_loss /= n;
        distillation_loss /= n;
        // No peers are queried by the reference model; the routed path
        // reports the local loss.
        let remote_loss = if remote { local_loss } else { 0.0 };

        if !local_loss.is_finite() || !distillation_loss.is_finite() {
            return Err(FleetError::model(format!(
                "non-finite loss (local={}, distillation={})",
                local_loss, distillation_loss
            )));
        }

        if update {
            let scale = 1.0 / n;
            for g in grad_token
                .iter_mut()
                .chain(grad_token_bias.iter_mut())
                .chain(grad_peer.iter_mut())
                .chain(grad_peer_bias.iter_mut())
            {
                *g *= scale;
            }
            let (lr, m) = (self.learning_rate, self.momentum);
            self.token_head.apply(&grad_token, lr, m);
            self.token_bias.apply(&grad_token_bias, lr, m);
            self.peer_head.apply(&grad_peer, lr, m);
            self.peer_bias.apply(&grad_peer_bias, lr, m);
            self.steps += 1;
        }

        Ok(ForwardOutput {
            local_loss,
            remote_loss,
            distillation_loss,
            weights,
        })
    }

    fn parameters(&self) -> Vec<ParameterView<'_>> {
        vec![
            ParameterView {
                name: "token_head",
                shape: vec![self.token_head.rows, self.token_head.cols],
                values: &self.token_head.values,
            },
            ParameterView {
                name: "token_bias",
                shape: vec![self.token_bias.rows],
                values: &self.token_bias.values,
            },
            ParameterView {
                name: "peer_head",
                shape: vec![self.peer_head.rows, self.peer_head.cols],
                values: &self.peer_head.values,
            },
            ParameterView {
                name: "peer_bias",
                shape: vec![self.peer_bias.rows],
                values: &self.peer_bias.values,
            },
        ]
    }

    fn state_dict(&self) -> Result<serde_json::Value> {
        let state = ModelState {
            vocab_size: self.token_head.rows,
            embedding_dim: self.token_head.cols,
            n_peers: self.peer_head.rows,
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            steps: self.steps,
            token_head: self.token_head.values.clone(),
            token_bias: self.token_bias.values.clone(),
            peer_head: self.peer_head.values.clone(),
            peer_bias: self.peer_bias.values.clone(),
        };
        Ok(serde_json::to_value(state)?)
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        match device {
            Device::Cpu => {
                self.device = device;
                debug!("model on {}", device);
                Ok(())
            }
            Device::Cuda(_) => Err(FleetError::config(format!(
                "device {} is not available to the reference model",
                device
            ))),
        }
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn resize_peers(&mut self, n: usize) -> Result<()> {
        if n < self.peer_head.rows {
            return Err(FleetError::model(format!(
                "cannot shrink peer head from {} to {}",
                self.peer_head.rows, n
            )));
        }
        self.peer_head.grow_rows(n);
        self.peer_bias.grow_rows(n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SharedParameters;
    use std::sync::Arc;

    fn model(n_peers: usize) -> (tempfile::TempDir, PeerScoringModel) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.bin");
        SharedParameters::export(&path, 16, 8, 3).unwrap();
        let params = Arc::new(SharedParameters::open(&path).unwrap());
        (dir, PeerScoringModel::new(params, n_peers, 0.5, 0.9, 3))
    }

    fn batch() -> Batch {
        Batch::new(vec![vec![1, 2, 3, 4], vec![2, 3, 4, 5], vec![5, 6, 7, 8]])
    }

    #[test]
    fn test_device_parse() {
        assert_eq!(Device::parse("cpu").unwrap(), Device::Cpu);
        assert_eq!(Device::parse("CUDA").unwrap(), Device::Cuda(0));
        assert_eq!(Device::parse("cuda:2").unwrap(), Device::Cuda(2));
        assert!(Device::parse("tpu").is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_forward_shapes() {
        let (_dir, mut m) = model(3);
        let out = m.forward(&batch(), false, true).unwrap();
        assert_eq!(out.weights.len(), 3);
        for row in &out.weights {
            assert_eq!(row.len(), 3);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        assert!(out.local_loss > 0.0);
        assert_eq!(out.remote_loss, out.local_loss);
    }

    #[test]
    fn test_training_reduces_loss() {
        let (_dir, mut m) = model(2);
        m.train();
        let first = m.forward(&batch(), true, false).unwrap().local_loss;
        let mut last = first;
        for _ in 0..50 {
            last = m.forward(&batch(), true, false).unwrap().local_loss;
        }
        assert!(last < first, "loss did not drop: {} -> {}", first, last);
        assert_eq!(m.steps(), 51);
    }

    #[test]
    fn test_eval_mode_does_not_update() {
        let (_dir, mut m) = model(2);
        let before = m.state_dict().unwrap();
        m.forward(&batch(), true, false).unwrap();
        assert_eq!(m.state_dict().unwrap(), before);
        assert_eq!(m.steps(), 0);
    }

    #[test]
    fn test_forward_rejects_bad_batches() {
        let (_dir, mut m) = model(1);
        assert!(m.forward(&Batch::default(), true, false).unwrap_err().is_transient());
        assert!(m.forward(&Batch::new(vec![vec![1]]), true, false).is_err());
        assert!(m.forward(&Batch::new(vec![vec![1, 99]]), true, false).is_err());
    }

    #[test]
    fn test_resize_peers() {
        let (_dir, mut m) = model(2);
        m.resize_peers(4).unwrap();
        assert_eq!(m.n_peers(), 4);
        let out = m.forward(&batch(), false, false).unwrap();
        assert_eq!(out.weights[0].len(), 4);
        assert!(m.resize_peers(3).is_err());
    }

    #[test]
    fn test_state_dict_and_parameters() {
        let (_dir, mut m) = model(2);
        m.set_learning_rate(0.1);
        let state: ModelState = serde_json::from_value(m.state_dict().unwrap()).unwrap();
        assert_eq!(state.vocab_size, 16);
        assert_eq!(state.n_peers, 2);
        assert_eq!(state.learning_rate, 0.1);

        let names: Vec<_> = m.parameters().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["token_head", "token_bias", "peer_head", "peer_bias"]);
    }

    #[test]
    fn test_cuda_unavailable() {
        let (_dir, mut m) = model(1);
        assert!(m.to_device(Device::Cpu).is_ok());
        assert!(m.to_device(Device::Cuda(0)).is_err());
        assert_eq!(m.device(), Device::Cpu);
    }
}
