//! Collaborator traits and types
//!
//! This module defines the seams between the protocol and the outside
//! world. Implementations must never block indefinitely: a directory that
//! cannot answer returns `None`, an empty listing or an error.

use swarm_sync_core::accumulator::Contribution;
use swarm_sync_core::group::Group;
use swarm_sync_core::identity::PeerId;
use swarm_sync_core::outcome::RoundReport;

use crate::Result;

/// A resolved, live route to a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ConnectionHandle {
    /// The resolved peer
    pub peer_id: PeerId,
    /// Transport-specific address
    pub address: String,
}

/// Peer discovery and the consensus view of training progress
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    /// Resolve a peer to a live connection; `None` when unreachable
    async fn resolve(&self, peer: &PeerId) -> Option<ConnectionHandle>;

    /// Peers currently advertised as candidates
    async fn list_candidates(&self) -> Vec<PeerId>;

    /// Epoch of the latest published consensus state; `Ok(None)` when nothing
    /// has been published yet
    async fn current_consensus_epoch(&self) -> Result<Option<u64>>;
}

/// The opaque averaging primitive
#[async_trait::async_trait]
pub trait Reducer: Send + Sync {
    /// Handle type for one in-flight round
    type Handle: RoundHandle + 'static;

    /// Start a round over `group` with this peer's contribution
    async fn begin_round(&self, group: &Group, contribution: Contribution) -> Result<Self::Handle>;
}

/// One in-flight reduction
pub trait RoundHandle: Send {
    /// Whether the reduction has finished, successfully or not
    fn done(&self) -> bool;

    /// Abort the reduction. Idempotent; a no-op on a finished handle.
    fn cancel(&mut self);

    /// Collect the result of a finished reduction
    fn result(&mut self) -> Result<RoundReport>;
}

/// Append-only tagged blob storage
#[async_trait::async_trait]
pub trait VersionedStore: Send + Sync {
    /// Upload `blob` and create the immutable tag `tag` pointing at it.
    ///
    /// Either both steps become visible or neither does. Fails with
    /// [`crate::Error::TagExists`] when the tag is already present.
    async fn put(&self, tag: u64, blob: Vec<u8>, commit_message: &str) -> Result<()>;

    /// Fetch the blob behind `tag`
    async fn get(&self, tag: u64) -> Result<Vec<u8>>;

    /// All tags in ascending order
    async fn list_tags(&self) -> Result<Vec<u64>>;
}
