//! Peer identity and role management
//!
//! This module defines peer identifiers and the role a node plays after a
//! round attempt.

use core::fmt;

use sha2::{Digest, Sha256};

/// Peer identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create a new PeerId from bytes
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a PeerId from a public key (SHA-256 hash)
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Get the raw bytes
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR of this id against a 32-byte key.
    ///
    /// Compared lexicographically, this is the distance metric used to
    /// order group members.
    pub fn xor(&self, key: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(key.iter())) {
            *o = a ^ b;
        }
        out
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Role of a node after its most recent round attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum NodeRole {
    /// Took part in the last round and may race to publish
    #[default]
    Participant,
    /// Could not complete a round; adopts the latest checkpoint and waits
    Follower,
}

impl NodeRole {
    /// Check if this node may attempt to publish a checkpoint
    pub fn can_publish(&self) -> bool {
        matches!(self, NodeRole::Participant)
    }
}
