//! Weight vectors and the shared weight matrix
//!
//! A `WeightVector` is one peer's relevance score over all peers. It is kept
//! L1-normalized: every entry non-negative, entries summing to 1.

use axonfleet_common::{FleetError, Result};
use serde::{Deserialize, Serialize};

/// Norms below this are treated as zero when normalizing
pub const NORM_EPSILON: f32 = 1e-12;

/// Ordered per-peer scores, indexed like the metagraph's neuron list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightVector(Vec<f32>);

impl WeightVector {
    /// Wrap raw scores without normalizing
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// All-zero vector of the given width
    pub fn zeros(len: usize) -> Self {
        Self(vec![0.0; len])
    }

    /// Uniform distribution of the given width
    pub fn uniform(len: usize) -> Self {
        if len == 0 {
            return Self::default();
        }
        Self(vec![1.0 / len as f32; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// L1 norm
    pub fn l1_norm(&self) -> f32 {
        self.0.iter().map(|v| v.abs()).sum()
    }

    /// Sum of entries
    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }

    /// Scale to unit L1 norm, clamping negative entries to zero first.
    ///
    /// A vector with no mass left becomes uniform, so the result always sums
    /// to 1 when the vector is non-empty.
    pub fn normalize_l1(&mut self) {
        for v in self.0.iter_mut() {
            if !v.is_finite() || *v < 0.0 {
                *v = 0.0;
            }
        }

        let norm = self.l1_norm();
        if norm < NORM_EPSILON {
            *self = Self::uniform(self.len());
            return;
        }

        for v in self.0.iter_mut() {
            *v /= norm;
        }
    }

    /// Exponential moving average toward `target`:
    /// `self = (1 - alpha) * self + alpha * target`
    pub fn smooth_toward(&mut self, target: &WeightVector, alpha: f32) -> Result<()> {
        if target.len() != self.len() {
            return Err(FleetError::invalid_input(format!(
                "weight contribution has {} entries, row has {}",
                target.len(),
                self.len()
            )));
        }

        for (row, t) in self.0.iter_mut().zip(target.0.iter()) {
            *row = (1.0 - alpha) * *row + alpha * t;
        }
        Ok(())
    }

    /// Column-wise mean over a batch of weight rows.
    ///
    /// Every row must have `width` entries and contain only finite values.
    /// Negative scores are clamped to zero.
    pub fn batch_mean(rows: &[Vec<f32>], width: usize) -> Result<WeightVector> {
        if rows.is_empty() {
            return Err(FleetError::invalid_input("empty batch weights"));
        }

        let mut mean = vec![0.0f32; width];
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(FleetError::invalid_input(format!(
                    "batch row {} has {} entries, expected {}",
                    i,
                    row.len(),
                    width
                )));
            }
            for (m, v) in mean.iter_mut().zip(row.iter()) {
                if !v.is_finite() {
                    return Err(FleetError::invalid_input(format!(
                        "batch row {} contains a non-finite weight",
                        i
                    )));
                }
                *m += v.max(0.0);
            }
        }

        let n = rows.len() as f32;
        for m in mean.iter_mut() {
            *m /= n;
        }
        Ok(WeightVector(mean))
    }
}

impl From<Vec<f32>> for WeightVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Dense row-major square matrix, `W[i, j]` = weight peer i assigns peer j
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightMatrix {
    n: usize,
    data: Vec<f32>,
}

impl WeightMatrix {
    /// All-zero `n x n` matrix
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// Build from rows; every row must have `rows.len()` entries
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let n = rows.len();
        let mut data = Vec::with_capacity(n * n);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n {
                return Err(FleetError::metagraph(format!(
                    "row {} has {} entries, expected {}",
                    i,
                    row.len(),
                    n
                )));
            }
            data.extend(row);
        }
        Ok(Self { n, data })
    }

    /// Number of peers
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f32> {
        if i >= self.n || j >= self.n {
            return None;
        }
        Some(self.data[i * self.n + j])
    }

    /// `W[i, :]`
    pub fn row(&self, i: usize) -> Option<WeightVector> {
        if i >= self.n {
            return None;
        }
        Some(WeightVector(self.data[i * self.n..(i + 1) * self.n].to_vec()))
    }

    /// `W[:, j]`
    pub fn column(&self, j: usize) -> Option<WeightVector> {
        if j >= self.n {
            return None;
        }
        Some(WeightVector(
            (0..self.n).map(|i| self.data[i * self.n + j]).collect(),
        ))
    }

    /// Replace `W[i, :]`
    pub fn set_row(&mut self, i: usize, row: &WeightVector) -> Result<()> {
        if i >= self.n || row.len() != self.n {
            return Err(FleetError::metagraph(format!(
                "cannot set row {} of width {} in a {}x{} matrix",
                i,
                row.len(),
                self.n,
                self.n
            )));
        }
        self.data[i * self.n..(i + 1) * self.n].copy_from_slice(row.as_slice());
        Ok(())
    }

    /// Grow to `n x n`, keeping existing entries and zero-filling new ones
    pub fn grow(&mut self, n: usize) {
        if n <= self.n {
            return;
        }
        let mut data = vec![0.0; n * n];
        for i in 0..self.n {
            data[i * n..i * n + self.n].copy_from_slice(&self.data[i * self.n..(i + 1) * self.n]);
        }
        self.n = n;
        self.data = data;
    }
}
