//! Round coordination
//!
//! One [`RoundCoordinator::run_round`] call is one attempt:
//!
//! ```text
//! Idle -> Forming -> Running -> {Succeeded, TimedOut, Cancelled, Errored} -> Idle
//! ```
//!
//! The coordinator never retries and keeps nothing between calls except the
//! round counter. It is the only place the reduction primitive is touched,
//! and every call into it is guarded: an error or a panic becomes
//! `RoundOutcome::Error`, never a crash.
//!
//! Once a contribution has been handed to the primitive, the local
//! accumulator is reset whatever the outcome.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use swarm_sync_core::accumulator::{Contribution, GradientAccumulator};
use swarm_sync_core::group::Group;
use swarm_sync_core::identity::PeerId;
use swarm_sync_core::outcome::RoundOutcome;
use swarm_sync_core::round::{RoundId, RoundPhase};
use swarm_sync_core::Error;
use swarm_sync_net::{Directory, Reducer, RoundHandle};
use swarm_sync_runtime::SwarmRuntime;

use crate::group::GroupFormer;
use crate::loading::ModelLoadingManager;
use crate::retry::bounded;
use crate::scorer::PeerScorer;

/// Polls granted to a cancelled handle before giving up on it
const SETTLE_POLLS: usize = 3;

/// Drives one averaging round at a time
pub struct RoundCoordinator<D, R, RT> {
    self_id: PeerId,
    former: GroupFormer<D, RT>,
    scorer: Arc<PeerScorer<D, RT>>,
    reducer: Arc<R>,
    runtime: Arc<RT>,
    loading: ModelLoadingManager,
    min_group_size: usize,
    poll_interval: Duration,
    round_lock: Mutex<()>,
    next_round: AtomicU64,
    phase: watch::Sender<RoundPhase>,
}

impl<D, R, RT> RoundCoordinator<D, R, RT>
where
    D: Directory,
    R: Reducer,
    RT: SwarmRuntime,
{
    /// Create a coordinator
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: PeerId,
        former: GroupFormer<D, RT>,
        scorer: Arc<PeerScorer<D, RT>>,
        reducer: Arc<R>,
        runtime: Arc<RT>,
        loading: ModelLoadingManager,
        min_group_size: usize,
        poll_interval: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(RoundPhase::Idle);
        Self {
            self_id,
            former,
            scorer,
            reducer,
            runtime,
            loading,
            min_group_size,
            poll_interval,
            round_lock: Mutex::new(()),
            next_round: AtomicU64::new(0),
            phase,
        }
    }

    /// Current phase
    pub fn phase(&self) -> RoundPhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes
    pub fn phases(&self) -> watch::Receiver<RoundPhase> {
        self.phase.subscribe()
    }

    /// Run one round over `candidates` within `deadline`.
    ///
    /// `seed` feeds the group id; peers that should meet in one round must
    /// pass the same seed (the node uses its local epoch). `cancel` aborts
    /// the round from outside.
    pub async fn run_round(
        &self,
        candidates: &[PeerId],
        seed: u64,
        deadline: Duration,
        accumulator: &mut GradientAccumulator,
        cancel: &CancellationToken,
    ) -> RoundOutcome {
        let round = RoundId(self.next_round.fetch_add(1, Ordering::SeqCst));

        let Ok(_exclusive) = self.round_lock.try_lock() else {
            return RoundOutcome::Error {
                round,
                cause: Error::RoundInProgress,
            };
        };
        if self.loading.is_loading() {
            return RoundOutcome::Error {
                round,
                cause: Error::LoadInProgress,
            };
        }

        let started = self.runtime.now();
        self.phase.send_replace(RoundPhase::Forming);
        let group = match self
            .former
            .form_group(&self.scorer, candidates, self.min_group_size, self.self_id, seed)
            .await
        {
            Ok(group) => group,
            Err(cause) => return self.finish(RoundOutcome::Error { round, cause }),
        };

        self.phase.send_replace(RoundPhase::Running);
        tracing::info!(
            %round,
            group = %group.group_id(),
            peers = group.peer_count(),
            samples = accumulator.samples(),
            "round started"
        );
        let contribution = accumulator.contribution();
        let outcome = self
            .drive(round, &group, contribution, started, deadline, cancel)
            .await;
        accumulator.reset();
        self.finish(outcome)
    }

    async fn drive(
        &self,
        round: RoundId,
        group: &Group,
        contribution: Contribution,
        started: u64,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> RoundOutcome {
        // Starting the round spends the same budget as running it.
        let remaining = deadline.saturating_sub(self.runtime.elapsed_since(started));
        let begin = AssertUnwindSafe(self.reducer.begin_round(group, contribution)).catch_unwind();
        let begun = tokio::select! {
            biased;
            begun = bounded(self.runtime.as_ref(), remaining, begin) => begun,
            _ = cancel.cancelled() => return RoundOutcome::Cancelled { round },
        };
        let mut handle = match begun {
            None => {
                tracing::warn!(%round, ?deadline, "reduction primitive did not start before the deadline");
                return RoundOutcome::Timeout { round };
            }
            Some(Ok(Ok(handle))) => handle,
            Some(Ok(Err(err))) => {
                return RoundOutcome::Error {
                    round,
                    cause: err.into(),
                }
            }
            Some(Err(payload)) => {
                return RoundOutcome::Error {
                    round,
                    cause: panic_cause(payload.as_ref()),
                }
            }
        };

        loop {
            match guarded(|| handle.done()) {
                Ok(true) => break,
                Ok(false) => {}
                Err(cause) => {
                    self.cancel_and_settle(&mut handle).await;
                    return RoundOutcome::Error { round, cause };
                }
            }

            if cancel.is_cancelled() {
                self.cancel_and_settle(&mut handle).await;
                return RoundOutcome::Cancelled { round };
            }

            let elapsed = self.runtime.elapsed_since(started);
            if elapsed >= deadline {
                tracing::warn!(%round, ?deadline, "round deadline exceeded, cancelling");
                self.cancel_and_settle(&mut handle).await;
                return RoundOutcome::Timeout { round };
            }

            let step = self.poll_interval.min(deadline - elapsed);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = self.runtime.sleep(step) => {}
            }
        }

        match guarded(|| handle.result()) {
            Ok(Ok(report)) => RoundOutcome::success(round, *group.group_id(), report),
            Ok(Err(err)) => RoundOutcome::Error {
                round,
                cause: err.into(),
            },
            Err(cause) => RoundOutcome::Error { round, cause },
        }
    }

    /// Cancel once, then give the handle a few polls to settle
    async fn cancel_and_settle<H: RoundHandle>(&self, handle: &mut H) {
        if let Err(cause) = guarded(|| handle.cancel()) {
            tracing::warn!(error = %cause, "cancel panicked");
            return;
        }
        for _ in 0..SETTLE_POLLS {
            if guarded(|| handle.done()).unwrap_or(true) {
                return;
            }
            self.runtime.sleep(self.poll_interval).await;
        }
        tracing::warn!("cancelled round did not settle");
    }

    fn finish(&self, outcome: RoundOutcome) -> RoundOutcome {
        let round = outcome.round();
        match &outcome {
            RoundOutcome::Success {
                participating_peers,
                failed_peers,
                reduction_result,
                ..
            } => tracing::info!(
                %round,
                peers = participating_peers.len(),
                failed = failed_peers.len(),
                samples = reduction_result.samples,
                "round succeeded"
            ),
            RoundOutcome::Timeout { .. } => tracing::warn!(%round, "round timed out"),
            RoundOutcome::Cancelled { .. } => tracing::info!(%round, "round cancelled"),
            RoundOutcome::Error { cause, .. } => tracing::warn!(%round, error = %cause, "round failed"),
        }
        self.phase.send_replace(outcome.phase());
        self.phase.send_replace(RoundPhase::Idle);
        outcome
    }
}

fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, Error> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_cause(payload.as_ref()))
}

fn panic_cause(payload: &(dyn Any + Send)) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::Reduction(format!("reduction primitive panicked: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_sync_core::scoring::ScoringRules;
    use swarm_sync_net::mock::{MockDirectory, MockReducer, ReducerBehavior};
    use swarm_sync_runtime::mock_runtime::MockRuntime;

    fn peer(id: u8) -> PeerId {
        PeerId::new([id; 32])
    }

    fn coordinator(
        behavior: ReducerBehavior,
        loading: ModelLoadingManager,
    ) -> (
        RoundCoordinator<MockDirectory, MockReducer, MockRuntime>,
        MockReducer,
        MockRuntime,
    ) {
        let dir = Arc::new(MockDirectory::new([peer(2), peer(3)]));
        let rt = Arc::new(MockRuntime::new());
        let reducer = MockReducer::new(behavior);
        let scorer = Arc::new(PeerScorer::new(
            Arc::clone(&dir),
            Arc::clone(&rt),
            ScoringRules::default(),
            Duration::from_secs(1),
        ));
        let former = GroupFormer::new(
            Arc::clone(&dir),
            Arc::clone(&rt),
            1,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let coordinator = RoundCoordinator::new(
            peer(1),
            former,
            scorer,
            Arc::new(reducer.clone()),
            Arc::clone(&rt),
            loading,
            2,
            Duration::from_secs(1),
        );
        (coordinator, reducer, (*rt).clone())
    }

    fn accumulator() -> GradientAccumulator {
        let mut acc = GradientAccumulator::new(peer(1), 2);
        acc.accumulate(&[1.0, 2.0], 8).unwrap();
        acc
    }

    #[tokio::test]
    async fn success_reports_group_and_resets_accumulator() {
        let (c, reducer, _) = coordinator(ReducerBehavior::Complete, ModelLoadingManager::new());
        let mut acc = accumulator();
        let outcome = c
            .run_round(&[peer(2), peer(3)], 0, Duration::from_secs(10), &mut acc, &CancellationToken::new())
            .await;
        match outcome {
            RoundOutcome::Success {
                participating_peers,
                reduction_result,
                ..
            } => {
                assert_eq!(participating_peers.len(), 3);
                assert_eq!(reduction_result.samples, 8);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(acc.is_empty());
        assert_eq!(reducer.contributions()[0].samples, 8);
        assert_eq!(c.phase(), RoundPhase::Idle);
    }

    #[tokio::test]
    async fn deadline_cancels_exactly_once() {
        let (c, reducer, rt) = coordinator(ReducerBehavior::Never, ModelLoadingManager::new());
        let mut acc = accumulator();
        let outcome = c
            .run_round(&[peer(2)], 0, Duration::from_secs(5), &mut acc, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RoundOutcome::Timeout { round: RoundId(0) });
        assert_eq!(reducer.cancel_calls(), 1);
        assert!(acc.is_empty());
        assert!(rt.now() >= 5_000);
    }

    #[tokio::test]
    async fn stalled_start_times_out_and_releases_the_round() {
        let (c, reducer, rt) = coordinator(ReducerBehavior::Unresponsive, ModelLoadingManager::new());
        let mut acc = accumulator();
        let outcome = c
            .run_round(&[peer(2)], 0, Duration::from_secs(5), &mut acc, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RoundOutcome::Timeout { round: RoundId(0) });
        assert!(rt.now() >= 5_000);
        assert!(acc.is_empty());
        assert!(reducer.contributions().is_empty());
        assert_eq!(c.phase(), RoundPhase::Idle);

        let again = c
            .run_round(&[peer(2)], 0, Duration::from_secs(5), &mut acc, &CancellationToken::new())
            .await;
        assert_eq!(again, RoundOutcome::Timeout { round: RoundId(1) });
    }

    #[tokio::test]
    async fn external_cancel_yields_cancelled() {
        let (c, reducer, _) = coordinator(ReducerBehavior::Never, ModelLoadingManager::new());
        let token = CancellationToken::new();
        token.cancel();
        let outcome = c
            .run_round(&[peer(2)], 0, Duration::from_secs(5), &mut accumulator(), &token)
            .await;
        assert!(matches!(outcome, RoundOutcome::Cancelled { .. }));
        assert_eq!(reducer.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn primitive_panic_becomes_error() {
        let (c, _, _) = coordinator(ReducerBehavior::Panic, ModelLoadingManager::new());
        let outcome = c
            .run_round(&[peer(2)], 0, Duration::from_secs(5), &mut accumulator(), &CancellationToken::new())
            .await;
        match outcome {
            RoundOutcome::Error {
                cause: Error::Reduction(message),
                ..
            } => assert!(message.contains("backend crashed")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(c.phase(), RoundPhase::Idle);
    }

    #[tokio::test]
    async fn primitive_error_becomes_error() {
        let (c, _, _) = coordinator(
            ReducerBehavior::FailResult("peer vanished".into()),
            ModelLoadingManager::new(),
        );
        let outcome = c
            .run_round(&[peer(2)], 0, Duration::from_secs(5), &mut accumulator(), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RoundOutcome::Error {
                cause: Error::Reduction(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn insufficient_peers_keeps_local_work() {
        let (c, reducer, _) = coordinator(ReducerBehavior::Complete, ModelLoadingManager::new());
        let mut acc = accumulator();
        let outcome = c
            .run_round(&[], 0, Duration::from_secs(5), &mut acc, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RoundOutcome::Error {
                cause: Error::InsufficientPeers { .. },
                ..
            }
        ));
        assert_eq!(acc.samples(), 8);
        assert!(reducer.contributions().is_empty());
    }

    #[tokio::test]
    async fn no_round_while_loading() {
        let loading = ModelLoadingManager::new();
        let (c, reducer, _) = coordinator(ReducerBehavior::Complete, loading.clone());
        let _guard = loading.try_guard().unwrap();
        let outcome = c
            .run_round(&[peer(2)], 0, Duration::from_secs(5), &mut accumulator(), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RoundOutcome::Error {
                cause: Error::LoadInProgress,
                ..
            }
        ));
        assert!(reducer.contributions().is_empty());
    }

    #[tokio::test]
    async fn phases_are_published() {
        let (c, _, _) = coordinator(ReducerBehavior::CompleteAfter(2), ModelLoadingManager::new());
        let mut phases = c.phases();
        c.run_round(&[peer(2)], 0, Duration::from_secs(5), &mut accumulator(), &CancellationToken::new())
            .await;
        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), RoundPhase::Idle);
    }
}
