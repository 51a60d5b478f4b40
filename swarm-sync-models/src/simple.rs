//! Simple reference model implementations
//!
//! These models are useful for testing and simulation.

use swarm_sync_core::checkpoint::StateBlob;
use swarm_sync_core::outcome::ReducedUpdate;
use swarm_sync_core::{Error, Result};

use crate::{ModelState, OptimizerState, Trainable};

const MODEL_NAME: &str = "linear";

/// A flat parameter vector trained with outer Nesterov SGD
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    /// Parameters
    pub weights: Vec<f32>,
    optimizer: OptimizerState,
}

impl LinearModel {
    /// Create a zero-initialized model
    pub fn new(dim: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            weights: vec![0.0; dim],
            optimizer: OptimizerState::new(learning_rate, momentum, dim),
        }
    }

    /// Initialize with reproducible pseudo-random weights
    pub fn with_random_init(mut self, seed: u64) -> Self {
        // LCG, so every peer seeded alike starts from identical weights
        let mut state = seed;
        for w in self.weights.iter_mut() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *w = ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5;
        }
        self
    }

    /// Outer optimizer state
    pub fn optimizer(&self) -> &OptimizerState {
        &self.optimizer
    }

    /// Gradient of `0.5 * |w - target|^2`, a toy objective for simulation
    pub fn loss_gradient(&self, target: &[f32]) -> Vec<f32> {
        self.weights
            .iter()
            .zip(target)
            .map(|(w, t)| w - t)
            .collect()
    }

    /// Whether every parameter is finite
    pub fn is_finite(&self) -> bool {
        self.weights.iter().all(|w| w.is_finite())
    }
}

impl Trainable for LinearModel {
    fn snapshot(&self) -> Result<StateBlob> {
        Ok(StateBlob {
            model: ModelState::new(MODEL_NAME, self.weights.clone()).to_bytes()?,
            auxiliary: self.optimizer.to_bytes()?,
        })
    }

    fn restore(&mut self, state: &StateBlob) -> Result<()> {
        let model = ModelState::from_bytes(&state.model)?;
        let optimizer = OptimizerState::from_bytes(&state.auxiliary)?;
        if model.parameters.len() != optimizer.velocity.len() {
            return Err(Error::CorruptState {
                reason: format!(
                    "{} parameters but {} momentum entries",
                    model.parameters.len(),
                    optimizer.velocity.len()
                ),
            });
        }
        if model.parameters.iter().any(|w| !w.is_finite()) {
            return Err(Error::CorruptState {
                reason: "checkpoint holds non-finite parameters".into(),
            });
        }
        self.weights = model.parameters;
        self.optimizer = optimizer;
        Ok(())
    }

    fn apply(&mut self, update: &ReducedUpdate) -> Result<()> {
        if update.gradients.len() != self.weights.len() {
            return Err(Error::InvalidGradient);
        }
        let OptimizerState {
            learning_rate,
            momentum,
            velocity,
            ..
        } = &mut self.optimizer;

        for ((w, v), g) in self.weights.iter_mut().zip(velocity.iter_mut()).zip(&update.gradients) {
            *v = *momentum * *v + g;
            *w -= *learning_rate * (g + *momentum * *v);
        }
        self.optimizer.epoch = self.optimizer.epoch.saturating_add(1);

        if !self.is_finite() {
            return Err(Error::CorruptState {
                reason: "non-finite parameters after outer step".into(),
            });
        }
        Ok(())
    }

    fn dim(&self) -> usize {
        self.weights.len()
    }
}
