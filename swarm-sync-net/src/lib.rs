//! # SwarmSync Network
//!
//! Collaborator seams for SwarmSync.
//!
//! The protocol components never talk to a transport, an averaging backend
//! or an artifact store directly. They go through three traits:
//! - [`Directory`]: peer lookup, candidate listing, consensus epoch
//! - [`Reducer`] / [`RoundHandle`]: the opaque averaging primitive
//! - [`VersionedStore`]: append-only tagged blob storage
//!
//! In-memory implementations with failure injection live in [`mock`].

pub mod mock;
pub mod traits;

pub use traits::{ConnectionHandle, Directory, Reducer, RoundHandle, VersionedStore};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::mock::*;
    pub use crate::traits::*;
    pub use crate::{Error, Result};
}

/// Result type for collaborator operations
pub type Result<T> = core::result::Result<T, Error>;

/// Collaborator error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The collaborator could not be reached
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    /// The call did not return within its bound
    #[error("timeout")]
    Timeout,
    /// The requested tag does not exist
    #[error("tag {tag} not found")]
    NotFound { tag: u64 },
    /// The tag is already present in the append-only store
    #[error("tag {tag} already exists")]
    TagExists { tag: u64 },
    /// The reduction primitive failed
    #[error("reduction failed: {0}")]
    Reduction(String),
    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<Error> for swarm_sync_core::Error {
    fn from(err: Error) -> Self {
        use swarm_sync_core::Error as Core;
        match err {
            Error::Unavailable(reason) => Core::StoreUnavailable {
                attempts: 1,
                reason,
            },
            Error::Timeout => Core::StoreUnavailable {
                attempts: 1,
                reason: "timeout".into(),
            },
            Error::NotFound { tag } => Core::NotFound { tag: Some(tag) },
            Error::TagExists { tag } => Core::PublishConflict {
                attempted: tag,
                latest: tag,
            },
            Error::Reduction(reason) => Core::Reduction(reason),
            Error::Serialization(reason) => Core::Serialization(reason),
        }
    }
}
