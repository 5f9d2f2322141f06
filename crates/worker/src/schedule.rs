//! Learning-rate schedule
//!
//! Linear warmup followed by cosine decay with hard restarts. The multiplier
//! reaches zero at `total_steps` and stays there.

use std::f32::consts::PI;

/// Warmup steps of the serving schedule
pub const DEFAULT_WARMUP_STEPS: u64 = 50;

/// Total steps of the serving schedule
pub const DEFAULT_TOTAL_STEPS: u64 = 300;

/// Warmup + cosine-with-hard-restarts multiplier over a base learning rate
#[derive(Debug, Clone, PartialEq)]
pub struct WarmupCosineSchedule {
    base_lr: f32,
    warmup_steps: u64,
    total_steps: u64,
    cycles: f32,
    step: u64,
}

impl WarmupCosineSchedule {
    pub fn new(base_lr: f32, warmup_steps: u64, total_steps: u64, cycles: f32) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            cycles,
            step: 0,
        }
    }

    /// Schedule used by the serving loop: one cycle, 50 warmup of 300 total
    pub fn serving(base_lr: f32) -> Self {
        Self::new(base_lr, DEFAULT_WARMUP_STEPS, DEFAULT_TOTAL_STEPS, 1.0)
    }

    /// Steps taken
    pub fn current_step(&self) -> u64 {
        self.step
    }

    /// Multiplier at `step`
    pub fn multiplier(&self, step: u64) -> f32 {
        if step < self.warmup_steps {
            return step as f32 / self.warmup_steps.max(1) as f32;
        }

        let progress =
            (step - self.warmup_steps) as f32 / self.total_steps.saturating_sub(self.warmup_steps).max(1) as f32;
        if progress >= 1.0 {
            return 0.0;
        }
        (0.5 * (1.0 + (PI * ((self.cycles * progress) % 1.0)).cos())).max(0.0)
    }

    /// Advance one step and return the new learning rate
    pub fn step(&mut self) -> f32 {
        self.step += 1;
        self.base_lr * self.multiplier(self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_is_linear() {
        let s = WarmupCosineSchedule::serving(1.0);
        assert_eq!(s.multiplier(0), 0.0);
        assert!((s.multiplier(25) - 0.5).abs() < 1e-6);
        assert!((s.multiplier(50) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_decay_to_zero() {
        let s = WarmupCosineSchedule::serving(1.0);
        assert!((s.multiplier(175) - 0.5).abs() < 1e-4);
        assert!(s.multiplier(299) < 0.001);
        assert_eq!(s.multiplier(300), 0.0);
        assert_eq!(s.multiplier(10_000), 0.0);
    }

    #[test]
    fn test_hard_restarts() {
        let s = WarmupCosineSchedule::new(1.0, 0, 100, 2.0);
        assert!((s.multiplier(0) - 1.0).abs() < 1e-6);
        assert!(s.multiplier(49) < 0.01);
        // Restarted at the start of the second cycle.
        assert!((s.multiplier(50) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_step_scales_base() {
        let mut s = WarmupCosineSchedule::serving(0.01);
        let lr = s.step();
        assert_eq!(s.current_step(), 1);
        assert!((lr - 0.01 / 50.0).abs() < 1e-9);
    }
}
