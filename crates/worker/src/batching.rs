//! Training batch sources
//!
//! The serving loop pulls one batch per local step. `SyntheticCorpus` yields
//! arithmetic token runs (`start, start + stride, ...` modulo the vocabulary)
//! so the next token is learnable from its context.

use crate::model::Batch;
use axonfleet_common::{FleetError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Strides the synthetic corpus draws from
const STRIDES: [u32; 4] = [1, 2, 3, 5];

/// Supplier of training batches
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Seeded generator of arithmetic token runs
#[derive(Debug, Clone)]
pub struct SyntheticCorpus {
    rng: StdRng,
    vocab_size: u32,
    batch_size: usize,
    sequence_length: usize,
    batches: u64,
}

impl SyntheticCorpus {
    pub fn new(vocab_size: usize, batch_size: usize, sequence_length: usize, seed: u64) -> Result<Self> {
        if vocab_size == 0 || vocab_size > u32::MAX as usize {
            return Err(FleetError::config(format!("unsupported vocabulary size {}", vocab_size)));
        }
        if batch_size == 0 {
            return Err(FleetError::config("batch size must be positive"));
        }
        if sequence_length < 2 {
            return Err(FleetError::config("sequences need at least 2 tokens"));
        }

        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            vocab_size: vocab_size as u32,
            batch_size,
            sequence_length,
            batches: 0,
        })
    }

    /// Batches produced so far
    pub fn batches(&self) -> u64 {
        self.batches
    }

    fn sequence(&mut self) -> Vec<u32> {
        let start = self.rng.random_range(0..self.vocab_size);
        let stride = STRIDES[self.rng.random_range(0..STRIDES.len())];
        (0..self.sequence_length as u32)
            .map(|i| ((start as u64 + i as u64 * stride as u64) % self.vocab_size as u64) as u32)
            .collect()
    }
}

impl BatchSource for SyntheticCorpus {
    fn next_batch(&mut self) -> Result<Batch> {
        let sequences = (0..self.batch_size).map(|_| self.sequence()).collect();
        self.batches += 1;
        trace!(batch = self.batches, "synthetic batch");
        Ok(Batch::new(sequences))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_shape_and_range() {
        let mut corpus = SyntheticCorpus::new(16, 4, 6, 1).unwrap();
        let batch = corpus.next_batch().unwrap();
        assert_eq!(batch.len(), 4);
        for seq in &batch.sequences {
            assert_eq!(seq.len(), 6);
            assert!(seq.iter().all(|t| *t < 16));
        }
        assert_eq!(corpus.batches(), 1);
    }

    #[test]
    fn test_sequences_are_arithmetic() {
        let mut corpus = SyntheticCorpus::new(1000, 8, 5, 9).unwrap();
        for seq in corpus.next_batch().unwrap().sequences {
            let stride = (seq[1] + 1000 - seq[0]) % 1000;
            assert!(STRIDES.contains(&stride));
            for pair in seq.windows(2) {
                assert_eq!((pair[0] + stride) % 1000, pair[1]);
            }
        }
    }

    #[test]
    fn test_same_seed_same_batches() {
        let mut a = SyntheticCorpus::new(64, 2, 4, 5).unwrap();
        let mut b = SyntheticCorpus::new(64, 2, 4, 5).unwrap();
        for _ in 0..3 {
            assert_eq!(a.next_batch().unwrap(), b.next_batch().unwrap());
        }
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(SyntheticCorpus::new(0, 1, 4, 0).is_err());
        assert!(SyntheticCorpus::new(8, 0, 4, 0).is_err());
        assert!(SyntheticCorpus::new(8, 1, 1, 0).is_err());
    }
}
