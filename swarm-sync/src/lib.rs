//! # SwarmSync
//!
//! Round coordination and progress reconciliation for swarms of untrusted
//! peers that average locally computed updates.
//!
//! A node decides when a round is due, forms a deterministic group with the
//! peers it can reach, runs one averaging round under a deadline, and then
//! either publishes the result as the next checkpoint or falls back to
//! follower behaviour and loads the checkpoint another peer published.
//! Peers never share memory and never take a global lock: they agree through
//! deterministic group ordering and the tag-collision check in the store.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use swarm_sync::prelude::*;
//!
//! let config = SyncConfig::builder().min_group_size(3).build()?;
//! let mut node = SyncNode::new(
//!     self_id,
//!     config,
//!     Arc::new(directory),
//!     Arc::new(reducer),
//!     Arc::new(store),
//!     LinearModel::new(128, 0.7, 0.9),
//!     Arc::new(TokioRuntime::new()),
//! )?;
//!
//! node.record_samples(&gradients, batch_size)?;
//! match node.tick().await? {
//!     TickReport::Published { epoch } => println!("committed epoch {epoch}"),
//!     report => println!("{report:?}"),
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `tokio-runtime` (default): Tokio-backed [`runtime::tokio_runtime::TokioRuntime`]
//!
//! ## Crate Structure
//!
//! - [`swarm_sync_core`]: protocol data and synchronous logic
//! - [`swarm_sync_net`]: directory, reducer and store seams with in-memory mocks
//! - [`swarm_sync_runtime`]: clock, sleep and spawn abstraction
//! - [`swarm_sync_models`]: the `Trainable` seam and a reference model

#![forbid(unsafe_code)]

// Re-export sub-crates
pub use swarm_sync_core as core;
pub use swarm_sync_models as models;
pub use swarm_sync_net as net;
pub use swarm_sync_runtime as runtime;

pub use swarm_sync_core::{Error, Result};

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod group;
pub mod loading;
pub mod node;
pub mod retry;
pub mod scorer;
pub mod tracker;

pub use checkpoint::{CheckpointCache, CheckpointPublisher, RecoveryLoader};
pub use config::{SyncConfig, SyncConfigBuilder};
pub use coordinator::RoundCoordinator;
pub use group::GroupFormer;
pub use loading::{LoadGuard, ModelLoadingManager};
pub use node::{SyncNode, TickReport};
pub use scorer::PeerScorer;
pub use tracker::ProgressTracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{CheckpointPublisher, RecoveryLoader};
    pub use crate::config::SyncConfig;
    pub use crate::coordinator::RoundCoordinator;
    pub use crate::loading::ModelLoadingManager;
    pub use crate::node::{SyncNode, TickReport};
    pub use crate::tracker::ProgressTracker;

    pub use swarm_sync_core::prelude::*;
    pub use swarm_sync_models::simple::LinearModel;
    pub use swarm_sync_models::Trainable;
    pub use swarm_sync_net::{Directory, Reducer, RoundHandle, VersionedStore};
    pub use swarm_sync_runtime::SwarmRuntime;

    #[cfg(feature = "tokio-runtime")]
    pub use swarm_sync_runtime::tokio_runtime::TokioRuntime;
}
