//! Local and global training progress
//!
//! The tracker is the only owner of the two [`Progress`] values. Readers
//! get copies; writers go through the methods below.
//!
//! Refreshing `global` never fails and never blocks past the configured
//! per-call bound: when the directory cannot answer, the last known value
//! is kept and the tick simply proceeds on slightly stale data.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use swarm_sync_core::progress::{DueReason, Progress, RoundPolicy};
use swarm_sync_net::Directory;
use swarm_sync_runtime::SwarmRuntime;
use tokio_util::sync::CancellationToken;

use crate::retry::bounded;

#[derive(Debug)]
struct TrackerState {
    local: Progress,
    global: Option<Progress>,
    last_round_ms: u64,
    stale_refreshes: u64,
}

/// Owner of local and global progress
pub struct ProgressTracker<D, RT> {
    directory: Arc<D>,
    runtime: Arc<RT>,
    policy: RoundPolicy,
    call_timeout: Duration,
    state: Mutex<TrackerState>,
}

impl<D, RT> ProgressTracker<D, RT>
where
    D: Directory,
    RT: SwarmRuntime,
{
    /// Create a tracker starting at epoch zero with no global view
    pub fn new(directory: Arc<D>, runtime: Arc<RT>, policy: RoundPolicy, call_timeout: Duration) -> Self {
        let now = runtime.now();
        Self {
            directory,
            runtime,
            policy,
            call_timeout,
            state: Mutex::new(TrackerState {
                local: Progress::default(),
                global: None,
                last_round_ms: now,
                stale_refreshes: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh `global` from the directory and return the global epoch.
    ///
    /// On failure or timeout the previous value is kept.
    pub async fn refresh(&self) -> Option<u64> {
        let fetched = bounded(
            self.runtime.as_ref(),
            self.call_timeout,
            self.directory.current_consensus_epoch(),
        )
        .await;

        let mut state = self.state();
        match fetched {
            Some(Ok(Some(epoch))) => {
                let samples = match state.global {
                    Some(g) if g.epoch == epoch => g.samples_accumulated,
                    _ => 0,
                };
                state.global = Some(Progress::new(epoch, samples));
            }
            Some(Ok(None)) => {
                // Nothing published yet; a view learned from our own publish wins.
                if state.global.is_none() {
                    tracing::trace!("no published state yet");
                }
            }
            Some(Err(err)) => {
                state.stale_refreshes += 1;
                tracing::debug!(error = %err, "consensus epoch unavailable, keeping last known");
            }
            None => {
                state.stale_refreshes += 1;
                tracing::debug!(timeout = ?self.call_timeout, "consensus epoch timed out, keeping last known");
            }
        }
        state.global.map(|g| g.epoch)
    }

    /// Last known global epoch; `None` when nothing has been published
    pub fn current_global_epoch(&self) -> Option<u64> {
        self.state().global.map(|g| g.epoch)
    }

    /// Copy of the local view
    pub fn local(&self) -> Progress {
        self.state().local
    }

    /// Copy of the global view
    pub fn global(&self) -> Option<Progress> {
        self.state().global
    }

    /// Whether local progress lags the global view
    pub fn is_behind(&self) -> bool {
        let state = self.state();
        state.local.is_behind(state.global.as_ref())
    }

    /// Why a round is due now, if it is
    pub fn is_round_due(&self) -> Option<DueReason> {
        let state = self.state();
        let since = self.runtime.elapsed_since(state.last_round_ms);
        self.policy.due(&state.local, state.global.as_ref(), since)
    }

    /// Advance local progress
    pub fn advance_local(&self, delta_epoch: u64, reset_samples: bool) {
        self.state().local.advance(delta_epoch, reset_samples);
    }

    /// Count locally processed samples
    pub fn record_local_samples(&self, n: u64) {
        self.state().local.record_samples(n);
    }

    /// Mirror a freshly loaded tag: local restarts empty at `tag`
    pub fn reset_to(&self, tag: u64) {
        let mut state = self.state();
        state.local = Progress::at_epoch(tag);
        if state.global.map_or(true, |g| g.epoch < tag) {
            state.global = Some(Progress::at_epoch(tag));
        }
    }

    /// Raise the global view to a tag known to be published
    pub fn observe_published(&self, tag: u64) {
        let mut state = self.state();
        if state.global.map_or(true, |g| g.epoch < tag) {
            state.global = Some(Progress::at_epoch(tag));
        }
    }

    /// Restart the tick-interval clock
    pub fn mark_round_started(&self) {
        let now = self.runtime.now();
        self.state().last_round_ms = now;
    }

    /// Refreshes that fell back to the last known value
    pub fn stale_refreshes(&self) -> u64 {
        self.state().stale_refreshes
    }

    /// Background refresh loop; returns when `shutdown` fires
    pub async fn run_refresh(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.runtime.sleep(interval) => {}
            }
            self.refresh().await;
        }
        tracing::debug!("progress refresh stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_sync_net::mock::MockDirectory;
    use swarm_sync_runtime::mock_runtime::MockRuntime;

    fn tracker(dir: &MockDirectory, rt: &MockRuntime) -> ProgressTracker<MockDirectory, MockRuntime> {
        ProgressTracker::new(
            Arc::new(dir.clone()),
            Arc::new(rt.clone()),
            RoundPolicy {
                sample_threshold: 10,
                tick_interval: Duration::from_secs(60),
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn refresh_reads_the_directory() {
        let dir = MockDirectory::default();
        dir.set_epoch(Some(4));
        let rt = MockRuntime::new();
        let t = tracker(&dir, &rt);
        assert_eq!(t.current_global_epoch(), None);
        assert_eq!(t.refresh().await, Some(4));
        assert!(t.is_behind());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_known_value() {
        let dir = MockDirectory::default();
        dir.set_epoch(Some(2));
        let rt = MockRuntime::new();
        let t = tracker(&dir, &rt);
        t.refresh().await;

        dir.set_unavailable(true);
        assert_eq!(t.refresh().await, Some(2));
        assert_eq!(t.stale_refreshes(), 1);
    }

    #[tokio::test]
    async fn reset_to_mirrors_loaded_tag() {
        let dir = MockDirectory::default();
        let rt = MockRuntime::new();
        let t = tracker(&dir, &rt);
        t.record_local_samples(50);
        t.reset_to(7);
        assert_eq!(t.local(), Progress::at_epoch(7));
        assert_eq!(t.current_global_epoch(), Some(7));
        assert!(!t.is_behind());
    }

    #[tokio::test]
    async fn round_due_by_samples_or_time() {
        let dir = MockDirectory::default();
        let rt = MockRuntime::new();
        let t = tracker(&dir, &rt);
        assert!(t.is_round_due().is_none());

        t.record_local_samples(10);
        assert!(matches!(t.is_round_due(), Some(DueReason::SampleThreshold { .. })));

        t.advance_local(1, true);
        assert!(t.is_round_due().is_none());
        rt.advance(Duration::from_secs(61));
        assert!(matches!(t.is_round_due(), Some(DueReason::TickInterval { .. })));

        t.mark_round_started();
        assert!(t.is_round_due().is_none());
    }

    #[tokio::test]
    async fn lagging_tracker_is_never_due() {
        let dir = MockDirectory::default();
        dir.set_epoch(Some(3));
        let rt = MockRuntime::new();
        let t = tracker(&dir, &rt);
        t.refresh().await;
        t.record_local_samples(1_000);
        assert!(t.is_round_due().is_none());
    }

    #[tokio::test]
    async fn refresh_loop_stops_on_shutdown() {
        let dir = MockDirectory::default();
        dir.set_epoch(Some(1));
        let rt = MockRuntime::new();
        let t = tracker(&dir, &rt);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        t.run_refresh(Duration::from_secs(1), shutdown).await;
        assert_eq!(t.current_global_epoch(), None);
    }
}
