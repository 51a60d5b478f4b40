//! Node driver
//!
//! [`SyncNode`] wires the components together and runs the control loop:
//! refresh progress, catch up when behind, run a round when one is due,
//! then either publish the result or fall back to follower behaviour and
//! reload the global checkpoint.
//!
//! Every recoverable failure ends the tick with a [`TickReport`]. Only
//! `LoadExhausted` escapes, because a node that cannot load any checkpoint
//! has no defined state to continue from.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use swarm_sync_core::accumulator::GradientAccumulator;
use swarm_sync_core::identity::PeerId;
use swarm_sync_core::outcome::{ReducedUpdate, RoundOutcome};
use swarm_sync_core::progress::Progress;
use swarm_sync_core::round::RoundPhase;
use swarm_sync_core::{Error, Result};
use swarm_sync_models::Trainable;
use swarm_sync_net::{Directory, Reducer, VersionedStore};
use swarm_sync_runtime::SwarmRuntime;

use crate::checkpoint::{CheckpointPublisher, RecoveryLoader};
use crate::config::SyncConfig;
use crate::coordinator::RoundCoordinator;
use crate::group::GroupFormer;
use crate::loading::ModelLoadingManager;
use crate::retry::bounded;
use crate::scorer::PeerScorer;
use crate::tracker::ProgressTracker;

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    /// Local progress lagged; the global tag was loaded
    CaughtUp { epoch: u64 },
    /// No round was due
    Idle,
    /// A load or another round is in flight
    Deferred,
    /// Too few usable peers; nothing was attempted
    Skipped { cause: Error },
    /// The round succeeded and this node committed the tag
    Published { epoch: u64 },
    /// The round succeeded but another node committed first; its state was adopted
    Adopted { epoch: u64 },
    /// The round or its publication failed; the node followed the global tag.
    /// `epoch` is `None` when nothing could be loaded yet.
    Recovered { outcome: RoundOutcome, epoch: Option<u64> },
    /// Shutdown cancelled the round
    Stopped,
}

/// One peer of the swarm
pub struct SyncNode<D, R, S, T, RT> {
    self_id: PeerId,
    config: SyncConfig,
    directory: Arc<D>,
    runtime: Arc<RT>,
    tracker: Arc<ProgressTracker<D, RT>>,
    scorer: Arc<PeerScorer<D, RT>>,
    coordinator: RoundCoordinator<D, R, RT>,
    publisher: CheckpointPublisher<S, RT>,
    loader: RecoveryLoader<S, RT>,
    loading: ModelLoadingManager,
    accumulator: GradientAccumulator,
    model: T,
    shutdown: CancellationToken,
    /// Global tag found corrupt, and the older tag loaded in its place
    settled_below: Option<(u64, u64)>,
}

impl<D, R, S, T, RT> SyncNode<D, R, S, T, RT>
where
    D: Directory + 'static,
    R: Reducer,
    S: VersionedStore,
    T: Trainable,
    RT: SwarmRuntime,
{
    /// Build a node; the configuration is validated first
    pub fn new(
        self_id: PeerId,
        config: SyncConfig,
        directory: Arc<D>,
        reducer: Arc<R>,
        store: Arc<S>,
        model: T,
        runtime: Arc<RT>,
    ) -> Result<Self> {
        config.validate()?;

        let tracker = Arc::new(ProgressTracker::new(
            Arc::clone(&directory),
            Arc::clone(&runtime),
            config.round_policy(),
            config.directory_timeout,
        ));
        let scorer = Arc::new(PeerScorer::new(
            Arc::clone(&directory),
            Arc::clone(&runtime),
            config.scoring_rules(),
            config.directory_timeout,
        ));
        let loading = ModelLoadingManager::new();
        let former = GroupFormer::new(
            Arc::clone(&directory),
            Arc::clone(&runtime),
            config.group_formation_attempts,
            config.candidate_poll_interval,
            config.directory_timeout,
        );
        let coordinator = RoundCoordinator::new(
            self_id,
            former,
            Arc::clone(&scorer),
            reducer,
            Arc::clone(&runtime),
            loading.clone(),
            config.min_group_size,
            config.round_poll_interval,
        );
        let publisher = CheckpointPublisher::new(
            Arc::clone(&store),
            Arc::clone(&runtime),
            config.publish_retry(),
            config.directory_timeout,
        );
        let loader = RecoveryLoader::new(
            store,
            Arc::clone(&runtime),
            config.load_retry(),
            config.directory_timeout,
            config.cache_capacity,
        );

        Ok(Self {
            self_id,
            directory,
            runtime,
            tracker,
            scorer,
            coordinator,
            publisher,
            loader,
            loading,
            accumulator: GradientAccumulator::new(self_id, model.dim()),
            model,
            shutdown: CancellationToken::new(),
            settled_below: None,
            config,
        })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn model(&self) -> &T {
        &self.model
    }

    /// Local progress
    pub fn local(&self) -> Progress {
        self.tracker.local()
    }

    pub fn tracker(&self) -> &ProgressTracker<D, RT> {
        &self.tracker
    }

    pub fn scorer(&self) -> &PeerScorer<D, RT> {
        &self.scorer
    }

    pub fn loading(&self) -> &ModelLoadingManager {
        &self.loading
    }

    pub fn phase(&self) -> RoundPhase {
        self.coordinator.phase()
    }

    /// Samples waiting for the next round
    pub fn pending_samples(&self) -> u64 {
        self.accumulator.samples()
    }

    /// Add one locally computed batch gradient
    pub fn record_samples(&mut self, gradients: &[f32], batch: u64) -> Result<()> {
        self.accumulator.accumulate(gradients, batch)?;
        self.tracker.record_local_samples(batch);
        Ok(())
    }

    /// Run one pass of the control loop
    pub async fn tick(&mut self) -> Result<TickReport> {
        self.tracker.refresh().await;

        if self.loading.is_loading() {
            return Ok(TickReport::Deferred);
        }

        if self.tracker.is_behind() && !self.settled_below_global() {
            let target = self.tracker.current_global_epoch();
            tracing::info!(local = self.tracker.local().epoch, ?target, "behind the swarm, catching up");
            return Ok(match self.recover(target).await? {
                Some(epoch) => {
                    self.note_fallback(target, epoch);
                    TickReport::CaughtUp { epoch }
                }
                None => TickReport::Idle,
            });
        }

        let Some(reason) = self.tracker.is_round_due() else {
            return Ok(TickReport::Idle);
        };
        tracing::debug!(?reason, "round due");

        let candidates = match bounded(
            self.runtime.as_ref(),
            self.config.directory_timeout,
            self.directory.list_candidates(),
        )
        .await
        {
            Some(candidates) => candidates,
            None => {
                tracing::warn!(timeout = ?self.config.directory_timeout, "candidate listing timed out");
                Vec::new()
            }
        };
        self.tracker.mark_round_started();
        let seed = self.tracker.local().epoch;
        let outcome = self
            .coordinator
            .run_round(
                &candidates,
                seed,
                self.config.round_timeout,
                &mut self.accumulator,
                &self.shutdown,
            )
            .await;
        self.scorer.update_from_round(&outcome);

        match outcome {
            RoundOutcome::Success {
                ref reduction_result,
                ..
            } => {
                let update = reduction_result.clone();
                self.commit(update, outcome).await
            }
            RoundOutcome::Error {
                cause: cause @ Error::InsufficientPeers { .. },
                ..
            } => Ok(TickReport::Skipped { cause }),
            RoundOutcome::Error {
                cause: Error::RoundInProgress | Error::LoadInProgress,
                ..
            } => Ok(TickReport::Deferred),
            RoundOutcome::Cancelled { .. } if self.shutdown.is_cancelled() => Ok(TickReport::Stopped),
            failed => self.follow(failed).await,
        }
    }

    /// Apply a successful reduction and try to publish it
    async fn commit(&mut self, update: ReducedUpdate, outcome: RoundOutcome) -> Result<TickReport> {
        let before = match self.model.snapshot() {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot failed before apply");
                return self.follow(outcome).await;
            }
        };
        if let Err(err) = self.model.apply(&update) {
            tracing::warn!(round = %outcome.round(), error = %err, "reduced update rejected");
            if let Err(err) = self.model.restore(&before) {
                tracing::warn!(error = %err, "restoring the pre-round state failed");
            }
            return self.follow(outcome).await;
        }

        self.tracker.advance_local(1, true);
        let epoch = self.tracker.local().epoch;
        let state = match self.model.snapshot() {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(epoch, error = %err, "snapshot failed after apply");
                return self.follow(outcome).await;
            }
        };

        match self.publisher.publish(&state, epoch, &outcome).await {
            Ok(checkpoint) => {
                self.tracker.observe_published(epoch);
                self.loader.remember(epoch, checkpoint.state);
                Ok(TickReport::Published { epoch })
            }
            Err(Error::PublishConflict { latest, .. }) => {
                tracing::info!(epoch, latest, "another peer published first, adopting its state");
                Ok(match self.recover(Some(latest)).await? {
                    Some(epoch) => TickReport::Adopted { epoch },
                    None => TickReport::Recovered {
                        outcome,
                        epoch: None,
                    },
                })
            }
            Err(err) => {
                tracing::warn!(epoch, error = %err, "publish failed, following the swarm");
                self.follow(outcome).await
            }
        }
    }

    /// Local state is the newest loadable tag below a corrupt global tag
    fn settled_below_global(&self) -> bool {
        let local = self.tracker.local().epoch;
        match (self.tracker.current_global_epoch(), self.settled_below) {
            (Some(global), Some((target, tag))) => global == target && local == tag,
            _ => false,
        }
    }

    fn note_fallback(&mut self, target: Option<u64>, epoch: u64) {
        let Some(target) = target.filter(|t| *t > epoch) else {
            return;
        };
        if self.settled_below != Some((target, epoch)) {
            tracing::warn!(
                global = target,
                loaded = epoch,
                "global checkpoint is unusable, continuing from an older tag"
            );
            self.settled_below = Some((target, epoch));
        }
    }

    /// Follower path: reload the current global tag
    async fn follow(&mut self, outcome: RoundOutcome) -> Result<TickReport> {
        let target = self.tracker.current_global_epoch();
        let epoch = self.recover(target).await?;
        if let Some(tag) = epoch {
            self.note_fallback(target, tag);
        }
        Ok(TickReport::Recovered { outcome, epoch })
    }

    /// `Ok(None)` when there was nothing to load or the load was deferred
    async fn recover(&mut self, target: Option<u64>) -> Result<Option<u64>> {
        match self
            .loader
            .recover(&mut self.model, &self.loading, &self.tracker, target)
            .await
        {
            Ok(tag) => Ok(Some(tag)),
            Err(Error::NotFound { tag: None }) => {
                tracing::debug!("nothing published yet, keeping local state");
                Ok(None)
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, "cannot load any checkpoint");
                Err(err)
            }
            Err(err) => {
                tracing::warn!(?target, error = %err, "recovery deferred to a later tick");
                Ok(None)
            }
        }
    }

    /// Tick until `shutdown` fires, refreshing progress in the background.
    ///
    /// Shutdown cancels an in-flight round. The loading guard is released
    /// when a load is dropped mid-way.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        self.shutdown = shutdown.child_token();

        let refresh = shutdown.child_token();
        let tracker = Arc::clone(&self.tracker);
        let interval = self.config.round_poll_interval;
        let stop = refresh.clone();
        self.runtime
            .spawn(async move { tracker.run_refresh(interval, stop).await });

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            match self.tick().await {
                Ok(TickReport::Stopped) => break Ok(()),
                Ok(report) => tracing::debug!(?report, "tick"),
                Err(err) => break Err(err),
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = self.runtime.sleep(interval) => {}
            }
        };

        refresh.cancel();
        tracing::info!(epoch = self.tracker.local().epoch, "node stopped");
        result
    }
}
