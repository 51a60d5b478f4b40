//! Deterministic peer groups
//!
//! Every member of a round must compute the same [`Group`] on its own,
//! without anyone broadcasting the order. Two rules make that possible:
//!
//! - the group id is derived from inputs every member already shares (the
//!   round seed and the member set), see [`GroupId::derive`]
//! - members are ordered by `peer_id XOR group_id`, compared as big-endian
//!   bytes, see [`order_by_distance`]
//!
//! A new seed or a change in membership yields a fresh id and therefore a
//! fresh order.

use core::fmt;
use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::identity::PeerId;

const GROUP_ID_DOMAIN: &[u8] = b"swarm-sync/group/v1";

/// Unique identifier of one round's group
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct GroupId(pub [u8; 32]);

impl GroupId {
    /// Derive the id every member computes independently.
    ///
    /// `sha256(domain || seed_be || member_0 || member_1 || ...)` with members
    /// in ascending id order.
    pub fn derive(seed: u64, members: &BTreeSet<PeerId>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(GROUP_ID_DOMAIN);
        hasher.update(seed.to_be_bytes());
        for member in members {
            hasher.update(member.as_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Get the raw bytes
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({self})")
    }
}

/// Order peers by XOR distance to the group id
pub fn order_by_distance(peers: &mut [PeerId], group_id: &GroupId) {
    peers.sort_by_cached_key(|p| p.xor(group_id.as_bytes()));
}

/// The ordered set of peers participating in one round.
///
/// Immutable once built; discarded when the round terminates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Group {
    group_id: GroupId,
    peer_ids: Vec<PeerId>,
}

impl Group {
    /// Build a group from an id and a member set; duplicates are dropped
    pub fn new(group_id: GroupId, members: impl IntoIterator<Item = PeerId>) -> Self {
        let unique: BTreeSet<PeerId> = members.into_iter().collect();
        let mut peer_ids: Vec<PeerId> = unique.into_iter().collect();
        order_by_distance(&mut peer_ids, &group_id);
        Self { group_id, peer_ids }
    }

    /// Build a group whose id is derived from `seed` and the members
    pub fn derive(seed: u64, members: impl IntoIterator<Item = PeerId>) -> Self {
        let unique: BTreeSet<PeerId> = members.into_iter().collect();
        let group_id = GroupId::derive(seed, &unique);
        Self::new(group_id, unique)
    }

    /// Group identifier
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Members in round order
    pub fn peer_ids(&self) -> &[PeerId] {
        &self.peer_ids
    }

    /// Number of members, including the local peer
    pub fn peer_count(&self) -> usize {
        self.peer_ids.len()
    }

    /// Check if a peer is a member
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peer_ids.contains(peer)
    }

    /// Position of a peer in round order
    pub fn position(&self, peer: &PeerId) -> Option<usize> {
        self.peer_ids.iter().position(|p| p == peer)
    }
}
