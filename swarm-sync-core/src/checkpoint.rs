//! Checkpoint payloads and their integrity manifest
//!
//! A checkpoint is the full learning state at one epoch: model parameters
//! plus auxiliary optimizer state. Both travel as opaque bytes; only the
//! model crate knows how to decode them. The [`Manifest`] records a SHA-256
//! of each part so a loader can reject a corrupted download before it
//! touches the live model.

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Serialized learning state
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StateBlob {
    /// Encoded model parameters
    pub model: Vec<u8>,
    /// Encoded optimizer state (learning rate, epoch, momentum)
    pub auxiliary: Vec<u8>,
}

impl StateBlob {
    /// Total payload size in bytes
    pub fn len(&self) -> usize {
        self.model.len() + self.auxiliary.len()
    }

    /// Whether both parts are empty
    pub fn is_empty(&self) -> bool {
        self.model.is_empty() && self.auxiliary.is_empty()
    }
}

/// Integrity record stored next to a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    /// Epoch tag the state was published under
    pub tag: u64,
    /// Hex SHA-256 of the model bytes
    pub model_sha256: String,
    /// Hex SHA-256 of the auxiliary bytes
    pub auxiliary_sha256: String,
    /// Byte length of the model part
    pub model_len: u64,
    /// Byte length of the auxiliary part
    pub auxiliary_len: u64,
}

impl Manifest {
    /// Describe `state` as published under `tag`
    pub fn for_state(tag: u64, state: &StateBlob) -> Self {
        Self {
            tag,
            model_sha256: sha256_hex(&state.model),
            auxiliary_sha256: sha256_hex(&state.auxiliary),
            model_len: state.model.len() as u64,
            auxiliary_len: state.auxiliary.len() as u64,
        }
    }

    /// Check that `state` matches this manifest and was stored under `tag`
    pub fn verify(&self, tag: u64, state: &StateBlob) -> Result<()> {
        if self.tag != tag {
            return Err(Error::CorruptState {
                reason: format!("manifest tag {} stored under {tag}", self.tag),
            });
        }
        if self.model_len != state.model.len() as u64
            || self.model_sha256 != sha256_hex(&state.model)
        {
            return Err(Error::CorruptState {
                reason: format!("model digest mismatch at tag {tag}"),
            });
        }
        if self.auxiliary_len != state.auxiliary.len() as u64
            || self.auxiliary_sha256 != sha256_hex(&state.auxiliary)
        {
            return Err(Error::CorruptState {
                reason: format!("optimizer digest mismatch at tag {tag}"),
            });
        }
        Ok(())
    }
}

/// A state blob together with its publication metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Epoch tag
    pub tag: u64,
    /// Learning state
    pub state: StateBlob,
    /// Human-readable commit message
    pub commit_message: String,
}

/// Commit message recorded with each publication
pub fn commit_message(epoch: u64, batch_size: u64, peers: usize) -> String {
    format!("Epoch {epoch}. Batch Size {batch_size}. Peers {peers}.")
}

/// Lowercase hex SHA-256
pub fn sha256_hex(bytes: &[u8]) -> String {
    use core::fmt::Write;

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        // Writing to a String cannot fail.
        let _ = write!(out, "{b:02x}");
    }
    out
}
