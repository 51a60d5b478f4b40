//! Group formation
//!
//! Candidates are filtered through the scorer. When too few remain, the
//! former polls the directory for more, a bounded number of times, before
//! giving up with `InsufficientPeers`. It never returns a group smaller than
//! the quorum.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use swarm_sync_core::group::Group;
use swarm_sync_core::identity::PeerId;
use swarm_sync_core::{Error, Result};
use swarm_sync_net::Directory;
use swarm_sync_runtime::SwarmRuntime;

use crate::retry::bounded;
use crate::scorer::PeerScorer;

/// Builds the deterministic group for one round
pub struct GroupFormer<D, RT> {
    directory: Arc<D>,
    runtime: Arc<RT>,
    attempts: u32,
    poll_interval: Duration,
    list_timeout: Duration,
}

impl<D, RT> GroupFormer<D, RT>
where
    D: Directory,
    RT: SwarmRuntime,
{
    /// Create a former that polls at most `attempts` times.
    ///
    /// A candidate listing slower than `list_timeout` counts as empty.
    pub fn new(
        directory: Arc<D>,
        runtime: Arc<RT>,
        attempts: u32,
        poll_interval: Duration,
        list_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            runtime,
            attempts: attempts.max(1),
            poll_interval,
            list_timeout,
        }
    }

    /// Form a group of at least `min_size` peers, counting `self_id`.
    ///
    /// The group id is derived from `seed` and the final member set, so
    /// every member holding the same candidates and scores computes the
    /// same ordered group.
    pub async fn form_group(
        &self,
        scorer: &PeerScorer<D, RT>,
        candidates: &[PeerId],
        min_size: usize,
        self_id: PeerId,
        seed: u64,
    ) -> Result<Group> {
        let mut pool: BTreeSet<PeerId> = candidates.iter().copied().collect();
        pool.remove(&self_id);

        let mut found = 1;
        for attempt in 1..=self.attempts {
            let listed: Vec<PeerId> = pool.iter().copied().collect();
            let usable = scorer.blacklist_filter(&listed).await;
            found = usable.len() + 1;

            if found >= min_size {
                let group = Group::derive(seed, usable.into_iter().chain([self_id]));
                tracing::debug!(
                    group = %group.group_id(),
                    peers = group.peer_count(),
                    attempt,
                    "group formed"
                );
                return Ok(group);
            }

            tracing::debug!(
                found,
                required = min_size,
                attempt,
                "not enough usable peers"
            );
            if attempt < self.attempts {
                self.runtime.sleep(self.poll_interval).await;
                let listed = bounded(
                    self.runtime.as_ref(),
                    self.list_timeout,
                    self.directory.list_candidates(),
                )
                .await;
                if listed.is_none() {
                    tracing::warn!(attempt, timeout = ?self.list_timeout, "candidate listing timed out");
                }
                pool.extend(listed.unwrap_or_default());
                pool.remove(&self_id);
            }
        }

        Err(Error::InsufficientPeers {
            found,
            required: min_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_sync_core::scoring::ScoringRules;
    use swarm_sync_net::mock::MockDirectory;
    use swarm_sync_runtime::mock_runtime::MockRuntime;

    fn peer(id: u8) -> PeerId {
        PeerId::new([id; 32])
    }

    struct Fixture {
        dir: MockDirectory,
        rt: MockRuntime,
        former: GroupFormer<MockDirectory, MockRuntime>,
        scorer: PeerScorer<MockDirectory, MockRuntime>,
    }

    fn fixture(peers: &[PeerId], attempts: u32) -> Fixture {
        let dir = MockDirectory::new(peers.iter().copied());
        let rt = MockRuntime::new();
        let former = GroupFormer::new(
            Arc::new(dir.clone()),
            Arc::new(rt.clone()),
            attempts,
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
        let scorer = PeerScorer::new(
            Arc::new(dir.clone()),
            Arc::new(rt.clone()),
            ScoringRules::default(),
            Duration::from_secs(1),
        );
        Fixture {
            dir,
            rt,
            former,
            scorer,
        }
    }

    #[tokio::test]
    async fn forms_group_including_self() {
        let f = fixture(&[peer(2), peer(3)], 1);
        let group = f
            .former
            .form_group(&f.scorer, &[peer(2), peer(3), peer(1)], 3, peer(1), 0)
            .await
            .unwrap();
        assert_eq!(group.peer_count(), 3);
        assert!(group.contains(&peer(1)));
    }

    #[tokio::test]
    async fn unreachable_peers_do_not_count_toward_quorum() {
        let f = fixture(&[peer(2), peer(3)], 1);
        f.dir.set_reachable(peer(3), false);
        let err = f
            .former
            .form_group(&f.scorer, &[peer(2), peer(3)], 3, peer(1), 0)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::InsufficientPeers {
                found: 2,
                required: 3
            }
        );
    }

    #[tokio::test]
    async fn broadens_pool_from_directory() {
        let f = fixture(&[peer(2)], 3);
        f.dir.reveal_later([peer(3), peer(4)]);
        let group = f
            .former
            .form_group(&f.scorer, &[peer(2)], 4, peer(1), 0)
            .await
            .unwrap();
        assert_eq!(group.peer_count(), 4);
        assert_eq!(f.dir.list_calls(), 1);
        assert_eq!(f.rt.now(), 500);
    }

    #[tokio::test]
    async fn two_peers_form_the_same_group() {
        let members = [peer(1), peer(2), peer(3), peer(4)];
        let f = fixture(&members, 1);
        let a = f
            .former
            .form_group(&f.scorer, &members, 4, peer(1), 11)
            .await
            .unwrap();
        let b = f
            .former
            .form_group(&f.scorer, &members, 4, peer(3), 11)
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unresponsive_directory_cannot_stall_formation() {
        let f = fixture(&[peer(2), peer(3)], 3);
        f.dir.set_unresponsive(true);
        let err = f
            .former
            .form_group(&f.scorer, &[peer(2), peer(3)], 3, peer(1), 0)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::InsufficientPeers {
                found: 1,
                required: 3
            }
        );
        assert_eq!(f.dir.list_calls(), 2);
    }
}
