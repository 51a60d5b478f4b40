//! Local gradient accumulation
//!
//! Work done between rounds is summed into a [`GradientAccumulator`]. At the
//! start of a round it is frozen into a [`Contribution`]; when the round
//! ends, whatever the outcome, the accumulator is reset so partial state
//! never leaks into the next attempt.

use crate::identity::PeerId;
use crate::{Error, Result};

/// One peer's input to a reduction
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Contribution {
    /// Sender's peer ID
    pub contributor: PeerId,
    /// Sample-weighted mean gradient
    pub gradients: Vec<f32>,
    /// Samples behind `gradients`
    pub samples: u64,
}

impl Contribution {
    /// Check if the contribution carries no work
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// Running sum of local gradients
#[derive(Debug, Clone)]
pub struct GradientAccumulator {
    contributor: PeerId,
    sum: Vec<f32>,
    samples: u64,
}

impl GradientAccumulator {
    /// Create an empty accumulator for `dim` parameters
    pub fn new(contributor: PeerId, dim: usize) -> Self {
        Self {
            contributor,
            sum: vec![0.0; dim],
            samples: 0,
        }
    }

    /// Add the mean gradient of one batch of `batch_size` samples
    pub fn accumulate(&mut self, gradients: &[f32], batch_size: u64) -> Result<()> {
        if gradients.len() != self.sum.len() {
            return Err(Error::InvalidGradient);
        }
        if gradients.iter().any(|g| !g.is_finite()) {
            return Err(Error::InvalidGradient);
        }
        let weight = batch_size as f32;
        for (s, g) in self.sum.iter_mut().zip(gradients) {
            *s += g * weight;
        }
        self.samples = self.samples.saturating_add(batch_size);
        Ok(())
    }

    /// Freeze the current state into a contribution
    pub fn contribution(&self) -> Contribution {
        let gradients = if self.samples == 0 {
            vec![0.0; self.sum.len()]
        } else {
            let n = self.samples as f32;
            self.sum.iter().map(|s| s / n).collect()
        };
        Contribution {
            contributor: self.contributor,
            gradients,
            samples: self.samples,
        }
    }

    /// Clear accumulated work
    pub fn reset(&mut self) {
        self.sum.iter_mut().for_each(|s| *s = 0.0);
        self.samples = 0;
    }

    /// Samples accumulated since the last reset
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Check if nothing has been accumulated
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Number of parameters
    pub fn dim(&self) -> usize {
        self.sum.len()
    }
}
