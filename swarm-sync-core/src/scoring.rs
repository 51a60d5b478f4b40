//! Peer trust and reachability table
//!
//! The [`ScoreBook`] owns one [`PeerRecord`] per peer ever seen. Records are
//! never deleted, only re-scored. A score of zero excludes the peer from
//! group formation, but zero is never permanent: the next reachability
//! observation after the cool-down recomputes it.
//!
//! Score of a record:
//! - `0` when the peer did not resolve on its last observation
//! - `0` while a post-round failure cool-down is active
//! - otherwise its `trust`, an EMA of post-round participation in `(0, 1]`

use std::collections::BTreeMap;
use std::time::Duration;

use crate::identity::PeerId;

/// One row of the membership table
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeerRecord {
    /// Opaque peer identifier
    pub peer_id: PeerId,
    /// Stable integer handle assigned on first sight
    pub uid: u32,
    /// Current score, always `>= 0`
    pub score: f32,
    /// Unix milliseconds of the last re-score
    pub last_updated: u64,
    /// Participation EMA
    pub trust: f32,
    /// Result of the last reachability observation
    pub reachable: bool,
    /// Unix milliseconds until which the peer scores zero
    pub cooldown_until: Option<u64>,
}

impl PeerRecord {
    fn recompute(&mut self, now_ms: u64) {
        let cooling = self.cooldown_until.is_some_and(|until| now_ms < until);
        if !cooling {
            self.cooldown_until = None;
        }
        self.score = if self.reachable && !cooling {
            self.trust
        } else {
            0.0
        };
        self.last_updated = now_ms;
    }
}

/// Parameters for score updates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringRules {
    /// Trust assigned to a newly seen peer
    pub initial_trust: f32,
    /// EMA weight of one successful participation
    pub participation_weight: f32,
    /// How long a failed peer scores zero
    pub failure_cooldown: Duration,
}

impl Default for ScoringRules {
    fn default() -> Self {
        Self {
            initial_trust: 0.5,
            participation_weight: 0.2,
            failure_cooldown: Duration::from_secs(300),
        }
    }
}

/// Score table keyed by peer id
#[derive(Debug, Clone, Default)]
pub struct ScoreBook {
    records: BTreeMap<PeerId, PeerRecord>,
    next_uid: u32,
    rules: ScoringRules,
}

impl ScoreBook {
    /// Create an empty table
    pub fn new(rules: ScoringRules) -> Self {
        Self {
            records: BTreeMap::new(),
            next_uid: 0,
            rules,
        }
    }

    fn entry(&mut self, peer: PeerId, now_ms: u64) -> &mut PeerRecord {
        let rules = self.rules;
        let next_uid = &mut self.next_uid;
        self.records.entry(peer).or_insert_with(|| {
            let uid = *next_uid;
            *next_uid = next_uid.wrapping_add(1);
            PeerRecord {
                peer_id: peer,
                uid,
                score: 0.0,
                last_updated: now_ms,
                trust: rules.initial_trust,
                reachable: false,
                cooldown_until: None,
            }
        })
    }

    /// Record the outcome of a directory lookup and return the new score
    pub fn observe_reachability(&mut self, peer: PeerId, reachable: bool, now_ms: u64) -> f32 {
        let record = self.entry(peer, now_ms);
        record.reachable = reachable;
        record.recompute(now_ms);
        record.score
    }

    /// Credit a peer that stayed through a completed round
    pub fn credit(&mut self, peer: PeerId, now_ms: u64) -> f32 {
        let w = self.rules.participation_weight;
        let record = self.entry(peer, now_ms);
        record.trust = (record.trust * (1.0 - w) + w).clamp(f32::MIN_POSITIVE, 1.0);
        record.reachable = true;
        record.recompute(now_ms);
        record.score
    }

    /// Zero a peer reported as failed for the cool-down window
    pub fn penalize(&mut self, peer: PeerId, now_ms: u64) {
        let cooldown_ms = self.rules.failure_cooldown.as_millis().min(u64::MAX as u128) as u64;
        let record = self.entry(peer, now_ms);
        record.cooldown_until = Some(now_ms.saturating_add(cooldown_ms));
        record.recompute(now_ms);
    }

    /// Current score; unknown peers score zero
    pub fn score(&self, peer: &PeerId) -> f32 {
        self.records.get(peer).map_or(0.0, |r| r.score)
    }

    /// Look up a record
    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    /// All records in peer id order
    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// Number of peers ever seen
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no peer has been seen yet
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Scores normalized to sum to one. All-zero scores stay zero.
    pub fn normalized(&self) -> BTreeMap<PeerId, f32> {
        let total: f32 = self.records.values().map(|r| r.score).sum();
        self.records
            .iter()
            .map(|(peer, r)| {
                let w = if total > 0.0 { r.score / total } else { 0.0 };
                (*peer, w)
            })
            .collect()
    }
}
