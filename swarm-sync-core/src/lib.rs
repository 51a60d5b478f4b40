//! # SwarmSync Core
//!
//! Core round-coordination primitives for SwarmSync.
//!
//! This crate is synchronous and I/O free. It provides:
//! - Peer, group and round identifiers
//! - Local/global progress and the round-due policy
//! - The peer score table and its update rules
//! - Deterministic group ordering
//! - Round outcomes, local gradient accumulation and averaging
//! - Checkpoint data and the tag lineage guard
//!
//! Everything that talks to a directory, a reducer or a store lives in
//! `swarm-sync-net` (the seams) and `swarm-sync` (the components).

pub mod accumulator;
pub mod aggregation;
pub mod checkpoint;
pub mod group;
pub mod identity;
pub mod lineage;
pub mod outcome;
pub mod progress;
pub mod round;
pub mod scoring;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accumulator::*;
    pub use crate::checkpoint::*;
    pub use crate::group::*;
    pub use crate::identity::*;
    pub use crate::outcome::*;
    pub use crate::progress::*;
    pub use crate::round::*;
    pub use crate::{Error, Result};
}

/// Result type for SwarmSync operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for SwarmSync operations.
///
/// Every component-level operation fails into one of these variants rather
/// than panicking. Only [`Error::LoadExhausted`] is fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Not enough usable peers to reach quorum
    #[error("insufficient peers: found {found}, required {required}")]
    InsufficientPeers { found: usize, required: usize },

    /// The round did not finish before its deadline
    #[error("round {round} timed out")]
    Timeout { round: round::RoundId },

    /// Another peer already committed this or a higher tag
    #[error("publish conflict: attempted tag {attempted}, store already has {latest}")]
    PublishConflict { attempted: u64, latest: u64 },

    /// The versioned store kept failing
    #[error("store unavailable after {attempts} attempts: {reason}")]
    StoreUnavailable { attempts: u32, reason: String },

    /// State failed validation (non-finite weights, digest mismatch)
    #[error("corrupt state: {reason}")]
    CorruptState { reason: String },

    /// No checkpoint could be loaded; the process cannot make progress
    #[error("unable to load any checkpoint after {attempts} attempts: {reason}")]
    LoadExhausted { attempts: u32, reason: String },

    /// The requested tag does not exist
    #[error("checkpoint tag {tag:?} not found")]
    NotFound { tag: Option<u64> },

    /// A model load is already in flight in this process
    #[error("a model load is already in progress")]
    LoadInProgress,

    /// A round is already running in this process
    #[error("a round is already in progress")]
    RoundInProgress,

    /// The reduction primitive failed
    #[error("reduction failed: {0}")]
    Reduction(String),

    /// Gradient shape does not match the accumulator
    #[error("gradient validation failed")]
    InvalidGradient,

    /// The store reported a tag sequence lower than one already observed
    #[error("tag lineage regressed: observed {observed} after {highest}")]
    LineageRegressed { observed: u64, highest: u64 },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Writing the staging area failed
    #[error("staging failed: {0}")]
    Staging(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the process must stop and escalate to its operator
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LoadExhausted { .. })
    }

    /// Whether a caller may retry or degrade to follower behaviour
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }
}
