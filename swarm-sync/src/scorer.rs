//! Peer scoring against live reachability
//!
//! Scores are re-evaluated on every formation pass: each candidate is
//! resolved through the directory and the [`ScoreBook`] is updated with the
//! result. Post-round credit is applied on every completed round. There is
//! no second, slower cadence; the two signals meet in the same record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;

use swarm_sync_core::identity::PeerId;
use swarm_sync_core::outcome::RoundOutcome;
use swarm_sync_core::scoring::{PeerRecord, ScoreBook, ScoringRules};
use swarm_sync_net::Directory;
use swarm_sync_runtime::SwarmRuntime;

use crate::retry::bounded;

/// Owner of the peer score table
pub struct PeerScorer<D, RT> {
    directory: Arc<D>,
    runtime: Arc<RT>,
    resolve_timeout: Duration,
    book: Mutex<ScoreBook>,
}

impl<D, RT> PeerScorer<D, RT>
where
    D: Directory,
    RT: SwarmRuntime,
{
    /// Create a scorer with an empty table.
    ///
    /// A resolve that takes longer than `resolve_timeout` counts as unreachable.
    pub fn new(directory: Arc<D>, runtime: Arc<RT>, rules: ScoringRules, resolve_timeout: Duration) -> Self {
        Self {
            directory,
            runtime,
            resolve_timeout,
            book: Mutex::new(ScoreBook::new(rules)),
        }
    }

    fn book(&self) -> MutexGuard<'_, ScoreBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve every peer and return its fresh score
    pub async fn score(&self, peers: &BTreeSet<PeerId>) -> BTreeMap<PeerId, f32> {
        let reachability = join_all(peers.iter().map(|peer| async move {
            let resolved = bounded(
                self.runtime.as_ref(),
                self.resolve_timeout,
                self.directory.resolve(peer),
            )
            .await;
            if resolved.is_none() {
                tracing::debug!(%peer, timeout = ?self.resolve_timeout, "resolve timed out");
            }
            (*peer, resolved.flatten().is_some())
        }))
        .await;

        let now = self.runtime.now();
        let mut book = self.book();
        reachability
            .into_iter()
            .map(|(peer, reachable)| (peer, book.observe_reachability(peer, reachable, now)))
            .collect()
    }

    /// Candidates with a positive score, in input order
    pub async fn blacklist_filter(&self, candidates: &[PeerId]) -> Vec<PeerId> {
        let unique: BTreeSet<PeerId> = candidates.iter().copied().collect();
        let scores = self.score(&unique).await;
        let mut seen = BTreeSet::new();
        let usable: Vec<PeerId> = candidates
            .iter()
            .filter(|p| scores.get(*p).is_some_and(|s| *s > 0.0))
            .filter(|p| seen.insert(**p))
            .copied()
            .collect();
        tracing::debug!(
            candidates = unique.len(),
            usable = usable.len(),
            "filtered candidates"
        );
        usable
    }

    /// Credit completed peers and cool down failed ones.
    ///
    /// Only a `Success` names individual peers; other outcomes leave the
    /// table untouched.
    pub fn update_from_round(&self, outcome: &RoundOutcome) {
        let RoundOutcome::Success {
            round, failed_peers, ..
        } = outcome
        else {
            return;
        };
        let now = self.runtime.now();
        let completed = outcome.completed_peers();
        let mut book = self.book();
        for peer in &completed {
            book.credit(*peer, now);
        }
        for peer in failed_peers {
            book.penalize(*peer, now);
        }
        tracing::debug!(
            %round,
            credited = completed.len(),
            penalized = failed_peers.len(),
            "scores updated"
        );
    }

    /// Current score of one peer; unknown peers score zero
    pub fn score_of(&self, peer: &PeerId) -> f32 {
        self.book().score(peer)
    }

    /// Copy of one peer's record
    pub fn record(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.book().get(peer).cloned()
    }

    /// Scores normalized to sum to one
    pub fn weights(&self) -> BTreeMap<PeerId, f32> {
        self.book().normalized()
    }
}
