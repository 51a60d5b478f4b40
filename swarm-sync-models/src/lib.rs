//! # SwarmSync Models
//!
//! The `Trainable` collaborator and reference model implementations.
//!
//! This crate provides:
//! - The [`Trainable`] trait the protocol drives (snapshot, restore, apply)
//! - Model and optimizer state serialization
//! - A reference [`simple::LinearModel`] with an outer Nesterov-SGD step

#![forbid(unsafe_code)]

pub mod simple;

use swarm_sync_core::checkpoint::StateBlob;
use swarm_sync_core::outcome::ReducedUpdate;
use swarm_sync_core::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::simple::*;
    pub use crate::{ModelState, OptimizerState, Trainable};
}

/// Model parameters plus outer optimizer, as seen by the protocol
pub trait Trainable: Send {
    /// Serialize the full learning state
    fn snapshot(&self) -> Result<StateBlob>;

    /// Replace the learning state with `state`
    fn restore(&mut self, state: &StateBlob) -> Result<()>;

    /// Take one outer step with a reduced update.
    ///
    /// Fails with [`Error::CorruptState`] when the step leaves non-finite
    /// parameters behind; the model must then be restored before use.
    fn apply(&mut self, update: &ReducedUpdate) -> Result<()>;

    /// Number of trainable parameters
    fn dim(&self) -> usize;
}

/// Model state for serialization
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelState {
    /// Model name/identifier
    pub name: String,
    /// Version of the model format
    pub version: u32,
    /// Flattened parameters
    pub parameters: Vec<f32>,
}

impl ModelState {
    /// Create a new model state
    pub fn new(name: impl Into<String>, parameters: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            parameters,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Companion state of the outer optimizer
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OptimizerState {
    /// Outer learning rate
    pub learning_rate: f32,
    /// Momentum coefficient
    pub momentum: f32,
    /// Outer steps applied, equal to the epoch of the state it belongs to
    pub epoch: u64,
    /// Momentum buffer, one entry per parameter
    pub velocity: Vec<f32>,
}

impl OptimizerState {
    /// Fresh optimizer state for `dim` parameters
    pub fn new(learning_rate: f32, momentum: f32, dim: usize) -> Self {
        Self {
            learning_rate,
            momentum,
            epoch: 0,
            velocity: vec![0.0; dim],
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}
