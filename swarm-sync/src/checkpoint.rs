//! Checkpoint publication and recovery
//!
//! A checkpoint travels as one sealed archive: the model part, the
//! optimizer part and a manifest with the SHA-256 of both. Sealing goes
//! through a scoped staging directory, so what is uploaded is exactly what
//! was written and read back. A reader can never pair model bytes from one
//! epoch with optimizer bytes from another, because both are inside the
//! same tagged upload and the manifest is checked on every load.
//!
//! Publishing re-reads the tag listing right before committing. If the
//! store already holds the same or a higher tag the publish aborts with
//! `PublishConflict` and the caller adopts the winner.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use swarm_sync_core::checkpoint::{commit_message, Checkpoint, Manifest, StateBlob};
use swarm_sync_core::lineage::TagLineage;
use swarm_sync_core::outcome::RoundOutcome;
use swarm_sync_core::{Error, Result};
use swarm_sync_models::Trainable;
use swarm_sync_net::{Directory, VersionedStore};
use swarm_sync_runtime::SwarmRuntime;

use crate::loading::ModelLoadingManager;
use crate::retry::{bounded, with_retries, Attempt, RetryError, RetryPolicy};
use crate::tracker::ProgressTracker;

const MODEL_FILE: &str = "model.bin";
const OPTIMIZER_FILE: &str = "optimizer.bin";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Serialize, Deserialize)]
struct CheckpointArchive {
    manifest: Manifest,
    state: StateBlob,
}

// =============================================================================
// Staging
// =============================================================================

/// Stage `state` on disk and seal it into one archive for `tag`.
///
/// The staging directory is removed when this returns, whatever happened.
pub fn seal(tag: u64, state: &StateBlob) -> Result<Vec<u8>> {
    let dir = tempfile::Builder::new()
        .prefix("swarm-sync-stage-")
        .tempdir()
        .map_err(staging)?;
    let root = dir.path();

    let manifest = Manifest::for_state(tag, state);
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).map_err(|e| Error::Serialization(e.to_string()))?;
    atomic_write(&root.join(MODEL_FILE), &state.model).map_err(staging)?;
    atomic_write(&root.join(OPTIMIZER_FILE), &state.auxiliary).map_err(staging)?;
    atomic_write(&root.join(MANIFEST_FILE), &manifest_json).map_err(staging)?;

    let staged = StateBlob {
        model: fs::read(root.join(MODEL_FILE)).map_err(staging)?,
        auxiliary: fs::read(root.join(OPTIMIZER_FILE)).map_err(staging)?,
    };
    let manifest: Manifest = serde_json::from_slice(&fs::read(root.join(MANIFEST_FILE)).map_err(staging)?)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    manifest.verify(tag, &staged)?;

    postcard::to_allocvec(&CheckpointArchive {
        manifest,
        state: staged,
    })
    .map_err(|e| Error::Serialization(e.to_string()))
}

/// Open an archive fetched for `tag`; anything that fails to decode or
/// verify is `CorruptState`
pub fn unseal(tag: u64, bytes: &[u8]) -> Result<StateBlob> {
    let archive: CheckpointArchive = postcard::from_bytes(bytes).map_err(|e| Error::CorruptState {
        reason: format!("undecodable archive at tag {tag}: {e}"),
    })?;
    archive.manifest.verify(tag, &archive.state)?;
    Ok(archive.state)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.flush()?;
        f.sync_all()?;
    }

    fs::rename(&tmp_path, path)
}

fn staging(err: io::Error) -> Error {
    Error::Staging(err.to_string())
}

fn timed_out(what: &str) -> Error {
    Error::StoreUnavailable {
        attempts: 1,
        reason: format!("{what} timed out"),
    }
}

// =============================================================================
// Local cache
// =============================================================================

/// Bounded LRU of decoded checkpoints keyed by tag
#[derive(Debug)]
pub struct CheckpointCache {
    entries: LruCache<u64, StateBlob>,
}

impl CheckpointCache {
    /// Create a cache holding at most `capacity` checkpoints (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Cached state for `tag`, marking it most recently used
    pub fn get(&mut self, tag: u64) -> Option<StateBlob> {
        self.entries.get(&tag).cloned()
    }

    /// Cache `state`, evicting the least recently used entry when full
    pub fn insert(&mut self, tag: u64, state: StateBlob) {
        self.entries.put(tag, state);
    }

    /// Drop `tag` if present
    pub fn forget(&mut self, tag: u64) {
        self.entries.pop(&tag);
    }

    /// Drop every entry except `keep`
    pub fn evict_except(&mut self, keep: u64) -> usize {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .map(|(tag, _)| *tag)
            .filter(|tag| *tag != keep)
            .collect();
        for tag in &stale {
            self.entries.pop(tag);
        }
        stale.len()
    }

    /// Whether `tag` is cached
    pub fn contains(&self, tag: u64) -> bool {
        self.entries.contains(&tag)
    }

    /// Number of cached checkpoints
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Commits new checkpoints to the versioned store
pub struct CheckpointPublisher<S, RT> {
    store: Arc<S>,
    runtime: Arc<RT>,
    policy: RetryPolicy,
    call_timeout: Duration,
    lineage: Mutex<TagLineage>,
}

impl<S, RT> CheckpointPublisher<S, RT>
where
    S: VersionedStore,
    RT: SwarmRuntime,
{
    /// Create a publisher; every store call is bounded by `call_timeout`
    pub fn new(store: Arc<S>, runtime: Arc<RT>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            runtime,
            policy,
            call_timeout,
            lineage: Mutex::new(TagLineage::new()),
        }
    }

    fn lineage(&self) -> MutexGuard<'_, TagLineage> {
        self.lineage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Highest tag this publisher has listed or committed
    pub fn highest_seen(&self) -> Option<u64> {
        self.lineage().highest()
    }

    /// Publish `state` under tag `epoch`.
    ///
    /// Transient store failures are retried from scratch up to the policy
    /// limit, then surface as `StoreUnavailable`. A tag that is already
    /// taken surfaces as `PublishConflict` without further retries.
    pub async fn publish(&self, state: &StateBlob, epoch: u64, outcome: &RoundOutcome) -> Result<Checkpoint> {
        let samples = match outcome {
            RoundOutcome::Success {
                reduction_result, ..
            } => reduction_result.samples,
            _ => 0,
        };
        let message = commit_message(epoch, samples, outcome.completed_peers().len());

        let published = with_retries(self.runtime.as_ref(), self.policy, "publish", |_| {
            self.attempt(state, epoch, &message)
        })
        .await;

        match published {
            Ok(()) => {
                tracing::info!(tag = epoch, bytes = state.len(), commit = %message, "checkpoint published");
                Ok(Checkpoint {
                    tag: epoch,
                    state: state.clone(),
                    commit_message: message,
                })
            }
            Err(RetryError::Aborted(err)) => {
                tracing::warn!(tag = epoch, error = %err, "publish aborted");
                Err(err)
            }
            Err(RetryError::Exhausted { attempts, last }) => Err(Error::StoreUnavailable {
                attempts,
                reason: last.to_string(),
            }),
        }
    }

    async fn attempt(&self, state: &StateBlob, epoch: u64, message: &str) -> Attempt<()> {
        let listed = match bounded(self.runtime.as_ref(), self.call_timeout, self.store.list_tags()).await {
            Some(Ok(tags)) => tags,
            Some(Err(err)) => return Attempt::Retry(err.into()),
            None => return Attempt::Retry(timed_out("tag listing")),
        };

        let admitted = {
            let mut lineage = self.lineage();
            lineage
                .observe(&listed)
                .map(|_| (lineage.admits(epoch), lineage.highest()))
        };
        match admitted {
            Err(err) => return Attempt::Abort(err),
            Ok((false, Some(latest))) => {
                return Attempt::Abort(Error::PublishConflict {
                    attempted: epoch,
                    latest,
                })
            }
            Ok(_) => {}
        }

        let sealed = match seal(epoch, state) {
            Ok(bytes) => bytes,
            Err(err) => return Attempt::Abort(err),
        };

        match bounded(
            self.runtime.as_ref(),
            self.call_timeout,
            self.store.put(epoch, sealed, message),
        )
        .await
        {
            Some(Ok(())) => {}
            Some(Err(swarm_sync_net::Error::TagExists { tag })) => {
                return Attempt::Abort(Error::PublishConflict {
                    attempted: epoch,
                    latest: tag,
                })
            }
            Some(Err(err)) => return Attempt::Retry(err.into()),
            None => return Attempt::Retry(timed_out("upload")),
        }

        match self.lineage().commit(epoch) {
            Ok(()) => Attempt::Done(()),
            Err(err) => Attempt::Abort(err),
        }
    }
}

// =============================================================================
// Recovery
// =============================================================================

/// Fetches, verifies and restores checkpoints
pub struct RecoveryLoader<S, RT> {
    store: Arc<S>,
    runtime: Arc<RT>,
    policy: RetryPolicy,
    call_timeout: Duration,
    cache: Mutex<CheckpointCache>,
    corrupt: Mutex<BTreeSet<u64>>,
}

impl<S, RT> RecoveryLoader<S, RT>
where
    S: VersionedStore,
    RT: SwarmRuntime,
{
    /// Create a loader keeping at most `cache_capacity` decoded checkpoints
    pub fn new(
        store: Arc<S>,
        runtime: Arc<RT>,
        policy: RetryPolicy,
        call_timeout: Duration,
        cache_capacity: usize,
    ) -> Self {
        Self {
            store,
            runtime,
            policy,
            call_timeout,
            cache: Mutex::new(CheckpointCache::new(cache_capacity)),
            corrupt: Mutex::new(BTreeSet::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, CheckpointCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn corrupt(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.corrupt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `tag` already failed verification; tags are immutable, so it
    /// is never fetched again
    pub fn is_corrupt(&self, tag: u64) -> bool {
        self.corrupt().contains(&tag)
    }

    /// Keep a state this process just published, so adopting it needs no read
    pub fn remember(&self, tag: u64, state: StateBlob) {
        self.cache().insert(tag, state);
    }

    /// Whether `tag` is held locally
    pub fn is_cached(&self, tag: u64) -> bool {
        self.cache().contains(tag)
    }

    /// Number of checkpoints held locally
    pub fn cached(&self) -> usize {
        self.cache().len()
    }

    /// List the store's tags, retrying transient failures
    pub async fn list_tags(&self) -> Result<Vec<u64>> {
        with_retries(self.runtime.as_ref(), self.policy, "list tags", |_| async {
            match bounded(self.runtime.as_ref(), self.call_timeout, self.store.list_tags()).await {
                Some(Ok(tags)) => Attempt::Done(tags),
                Some(Err(err)) => Attempt::Retry(err.into()),
                None => Attempt::Retry(timed_out("tag listing")),
            }
        })
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { attempts, last } => Error::StoreUnavailable {
                attempts,
                reason: last.to_string(),
            },
            RetryError::Aborted(err) => err,
        })
    }

    /// Load `expected`, or the newest listed tag when `None`.
    ///
    /// Returns the tag together with its verified state. An empty store is
    /// `NotFound { tag: None }`.
    pub async fn load_latest(&self, expected: Option<u64>) -> Result<(u64, StateBlob)> {
        let tag = match expected {
            Some(tag) => tag,
            None => self
                .list_tags()
                .await?
                .into_iter()
                .max()
                .ok_or(Error::NotFound { tag: None })?,
        };
        let state = self.load_tag(tag).await?;
        Ok((tag, state))
    }

    /// Load and verify one tag; read failures exhaust into `LoadExhausted`
    pub async fn load_tag(&self, tag: u64) -> Result<StateBlob> {
        if let Some(state) = self.cache().get(tag) {
            tracing::debug!(tag, "checkpoint served from cache");
            return Ok(state);
        }

        let bytes = with_retries(self.runtime.as_ref(), self.policy, "load", |_| async {
            match bounded(self.runtime.as_ref(), self.call_timeout, self.store.get(tag)).await {
                Some(Ok(bytes)) => Attempt::Done(bytes),
                Some(Err(swarm_sync_net::Error::NotFound { tag })) => {
                    Attempt::Abort(Error::NotFound { tag: Some(tag) })
                }
                Some(Err(err)) => Attempt::Retry(err.into()),
                None => Attempt::Retry(timed_out("read")),
            }
        })
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { attempts, last } => Error::LoadExhausted {
                attempts,
                reason: format!("tag {tag}: {last}"),
            },
            RetryError::Aborted(err) => err,
        })?;

        let state = unseal(tag, &bytes)?;
        let mut cache = self.cache();
        cache.insert(tag, state.clone());
        let evicted = cache.evict_except(tag);
        if evicted > 0 {
            tracing::debug!(tag, evicted, "evicted stale checkpoints");
        }
        Ok(state)
    }

    /// Restore `model` from `target` (or the newest tag).
    ///
    /// A corrupt candidate is remembered and the next lower listed tag is
    /// tried instead. A `target` the store does not hold yet is returned as
    /// `NotFound` so the caller retries later rather than settling on an
    /// older tag.
    ///
    /// Holds the loading guard for the whole attempt. On success local
    /// progress mirrors the loaded tag with zero samples.
    pub async fn recover<T, D>(
        &self,
        model: &mut T,
        loading: &ModelLoadingManager,
        tracker: &ProgressTracker<D, RT>,
        target: Option<u64>,
    ) -> Result<u64>
    where
        T: Trainable + ?Sized,
        D: Directory,
    {
        let Some(guard) = loading.try_guard() else {
            return Err(Error::LoadInProgress);
        };

        let candidates = self.candidates(target).await?;
        let mut last = None;
        for tag in &candidates {
            let tag = *tag;
            if self.is_corrupt(tag) {
                tracing::debug!(tag, "skipping known corrupt checkpoint");
                last = Some(Error::CorruptState {
                    reason: format!("tag {tag} failed verification earlier"),
                });
                continue;
            }
            let restored = match self.load_tag(tag).await {
                Ok(state) => model.restore(&state),
                Err(err) => Err(err),
            };
            match restored {
                Ok(()) => {
                    tracker.reset_to(tag);
                    guard.finish(true, Some(tag));
                    tracing::info!(tag, "state recovered");
                    return Ok(tag);
                }
                Err(err @ Error::NotFound { .. }) if Some(tag) == target => {
                    tracing::info!(tag, "target checkpoint not in the store yet");
                    return Err(err);
                }
                Err(err @ (Error::CorruptState { .. } | Error::Serialization(_))) => {
                    self.cache().forget(tag);
                    if self.corrupt().insert(tag) {
                        tracing::warn!(tag, error = %err, "checkpoint is corrupt, skipping it from now on");
                    }
                    last = Some(err);
                }
                Err(err @ Error::NotFound { .. }) => {
                    tracing::warn!(tag, error = %err, "listed checkpoint vanished, trying an older tag");
                    self.cache().forget(tag);
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let reason = last.map_or_else(|| "no candidate tags".to_string(), |err| err.to_string());
        tracing::error!(tried = candidates.len(), %reason, "no loadable checkpoint");
        Err(Error::LoadExhausted {
            attempts: u32::try_from(candidates.len()).unwrap_or(u32::MAX),
            reason,
        })
    }

    /// Target first, then every lower listed tag, newest first
    async fn candidates(&self, target: Option<u64>) -> Result<Vec<u64>> {
        let listed = self.list_tags().await;
        let mut tags = match (target, listed) {
            (Some(target), Ok(listed)) => {
                let mut tags: Vec<u64> = listed.into_iter().filter(|t| *t < target).collect();
                tags.push(target);
                tags
            }
            (Some(target), Err(err)) => {
                tracing::warn!(tag = target, error = %err, "listing failed, trying target only");
                vec![target]
            }
            (None, Ok(listed)) => listed,
            (None, Err(err)) => {
                return Err(Error::LoadExhausted {
                    attempts: self.policy.limit,
                    reason: err.to_string(),
                })
            }
        };
        tags.sort_unstable_by(|a, b| b.cmp(a));
        tags.dedup();
        if tags.is_empty() {
            return Err(Error::NotFound { tag: None });
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_sync_core::group::GroupId;
    use swarm_sync_core::identity::PeerId;
    use swarm_sync_core::outcome::{ReducedUpdate, RoundReport};
    use swarm_sync_core::progress::{Progress, RoundPolicy};
    use swarm_sync_core::round::RoundId;
    use swarm_sync_models::simple::LinearModel;
    use swarm_sync_net::mock::{MemoryStore, MockDirectory, PutFault};
    use swarm_sync_runtime::mock_runtime::MockRuntime;

    fn peer(id: u8) -> PeerId {
        PeerId::new([id; 32])
    }

    fn blob(seed: u8) -> StateBlob {
        StateBlob {
            model: vec![seed; 16],
            auxiliary: vec![seed.wrapping_add(1); 8],
        }
    }

    fn success() -> RoundOutcome {
        RoundOutcome::success(
            RoundId(0),
            GroupId([0; 32]),
            RoundReport {
                participating_peers: vec![peer(1), peer(2), peer(3)],
                failed_peers: vec![peer(3)],
                reduction_result: ReducedUpdate {
                    gradients: vec![0.0],
                    samples: 32,
                },
            },
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            limit: 3,
            delay: Duration::from_millis(10),
        }
    }

    fn publisher(store: &MemoryStore) -> CheckpointPublisher<MemoryStore, MockRuntime> {
        CheckpointPublisher::new(
            Arc::new(store.clone()),
            Arc::new(MockRuntime::new()),
            policy(),
            Duration::from_secs(1),
        )
    }

    fn loader(store: &MemoryStore) -> RecoveryLoader<MemoryStore, MockRuntime> {
        RecoveryLoader::new(
            Arc::new(store.clone()),
            Arc::new(MockRuntime::new()),
            policy(),
            Duration::from_secs(1),
            2,
        )
    }

    #[test]
    fn seal_roundtrips_and_detects_tampering() {
        let state = blob(3);
        let mut sealed = seal(9, &state).unwrap();
        assert_eq!(unseal(9, &sealed).unwrap(), state);
        assert!(matches!(unseal(10, &sealed), Err(Error::CorruptState { .. })));

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(unseal(9, &sealed), Err(Error::CorruptState { .. })));
    }

    #[test]
    fn cache_eviction_keeps_loaded_tag() {
        let mut cache = CheckpointCache::new(3);
        for tag in 1..=3 {
            cache.insert(tag, blob(tag as u8));
        }
        assert_eq!(cache.evict_except(2), 2);
        assert!(cache.contains(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn publish_records_commit_message() {
        let store = MemoryStore::new();
        let p = publisher(&store);
        let checkpoint = p.publish(&blob(1), 1, &success()).await.unwrap();
        assert_eq!(checkpoint.tag, 1);
        assert_eq!(
            store.commit_message(1).as_deref(),
            Some("Epoch 1. Batch Size 32. Peers 2.")
        );
        assert_eq!(p.highest_seen(), Some(1));
    }

    #[tokio::test]
    async fn publish_never_reuses_a_listed_tag() {
        let store = MemoryStore::new();
        publisher(&store).publish(&blob(1), 5, &success()).await.unwrap();

        let err = publisher(&store)
            .publish(&blob(2), 5, &success())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::PublishConflict {
                attempted: 5,
                latest: 5
            }
        );
        assert_eq!(store.put_calls(), 1);
    }

    #[tokio::test]
    async fn stale_listing_is_caught_by_the_store() {
        let store = MemoryStore::new();
        publisher(&store).publish(&blob(1), 5, &success()).await.unwrap();
        store.set_stale_listing(true);

        let err = publisher(&store)
            .publish(&blob(2), 5, &success())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublishConflict { latest: 5, .. }));
    }

    #[tokio::test]
    async fn failed_tag_creation_is_retried_from_scratch() {
        let store = MemoryStore::new();
        store.fail_next_put(PutFault::TagCreation);
        publisher(&store).publish(&blob(1), 2, &success()).await.unwrap();
        assert_eq!(store.put_calls(), 2);
        assert_eq!(store.orphaned_uploads(), 1);
        assert_eq!(store.tags(), vec![2]);
    }

    #[tokio::test]
    async fn publish_exhaustion_is_surfaced() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.fail_next_put(PutFault::Upload);
        }
        let err = publisher(&store)
            .publish(&blob(1), 2, &success())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { attempts: 3, .. }));
        assert!(store.tags().is_empty());
    }

    #[tokio::test]
    async fn load_latest_is_idempotent() {
        let store = MemoryStore::new();
        let p = publisher(&store);
        p.publish(&blob(1), 1, &success()).await.unwrap();
        p.publish(&blob(2), 2, &success()).await.unwrap();

        let l = loader(&store);
        let first = l.load_latest(None).await.unwrap();
        let second = l.load_latest(None).await.unwrap();
        assert_eq!(first, (2, blob(2)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_store_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            loader(&store).load_latest(None).await.unwrap_err(),
            Error::NotFound { tag: None }
        );
    }

    #[tokio::test]
    async fn read_failures_exhaust_into_load_exhausted() {
        let store = MemoryStore::new();
        publisher(&store).publish(&blob(1), 1, &success()).await.unwrap();
        store.fail_next_gets(3);
        let err = loader(&store).load_tag(1).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.get_calls(), 3);
    }

    #[tokio::test]
    async fn recover_falls_back_past_a_corrupt_tag() {
        let store = MemoryStore::new();
        let p = publisher(&store);
        let mut source = LinearModel::new(2, 0.5, 0.0);
        source.weights = vec![1.0, 2.0];
        p.publish(&source.snapshot().unwrap(), 1, &success()).await.unwrap();
        source.weights = vec![3.0, 4.0];
        p.publish(&source.snapshot().unwrap(), 2, &success()).await.unwrap();
        store.tamper(2, |bytes| {
            let last = bytes.len() - 1;
            bytes[last] ^= 0xff;
        });

        let rt = Arc::new(MockRuntime::new());
        let tracker = ProgressTracker::new(
            Arc::new(MockDirectory::default()),
            Arc::clone(&rt),
            RoundPolicy::default(),
            Duration::from_secs(1),
        );
        let loading = ModelLoadingManager::new();
        let mut model = LinearModel::new(2, 0.5, 0.0);

        let tag = loader(&store)
            .recover(&mut model, &loading, &tracker, Some(2))
            .await
            .unwrap();
        assert_eq!(tag, 1);
        assert_eq!(model.weights, vec![1.0, 2.0]);
        assert_eq!(tracker.local(), Progress::at_epoch(1));
        assert_eq!(loading.last_loaded_epoch(), Some(1));
        assert!(!loading.is_loading());
    }

    fn tracker() -> ProgressTracker<MockDirectory, MockRuntime> {
        ProgressTracker::new(
            Arc::new(MockDirectory::default()),
            Arc::new(MockRuntime::new()),
            RoundPolicy::default(),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn recover_waits_for_a_target_the_store_lacks() {
        let store = MemoryStore::new();
        let p = publisher(&store);
        let source = LinearModel::new(2, 0.5, 0.0);
        p.publish(&source.snapshot().unwrap(), 1, &success()).await.unwrap();
        p.publish(&source.snapshot().unwrap(), 2, &success()).await.unwrap();

        let tracker = tracker();
        let loading = ModelLoadingManager::new();
        let mut model = LinearModel::new(2, 0.5, 0.0);
        let err = loader(&store)
            .recover(&mut model, &loading, &tracker, Some(3))
            .await
            .unwrap_err();

        assert_eq!(err, Error::NotFound { tag: Some(3) });
        assert!(!err.is_fatal());
        assert_eq!(tracker.local(), Progress::at_epoch(0));
        assert_eq!(loading.last_loaded_epoch(), None);
        assert!(!loading.is_loading());
    }

    #[tokio::test]
    async fn corrupt_tag_is_fetched_only_once() {
        let store = MemoryStore::new();
        let p = publisher(&store);
        let source = LinearModel::new(2, 0.5, 0.0);
        p.publish(&source.snapshot().unwrap(), 1, &success()).await.unwrap();
        p.publish(&source.snapshot().unwrap(), 2, &success()).await.unwrap();
        store.tamper(2, |bytes| bytes.truncate(3));

        let tracker = tracker();
        let loading = ModelLoadingManager::new();
        let mut model = LinearModel::new(2, 0.5, 0.0);
        let l = loader(&store);

        assert_eq!(l.recover(&mut model, &loading, &tracker, Some(2)).await, Ok(1));
        assert!(l.is_corrupt(2));
        let reads = store.get_calls();

        assert_eq!(l.recover(&mut model, &loading, &tracker, Some(2)).await, Ok(1));
        assert_eq!(store.get_calls(), reads);
    }

    #[tokio::test]
    async fn recover_respects_an_in_flight_load() {
        let store = MemoryStore::new();
        let tracker = ProgressTracker::new(
            Arc::new(MockDirectory::default()),
            Arc::new(MockRuntime::new()),
            RoundPolicy::default(),
            Duration::from_secs(1),
        );
        let loading = ModelLoadingManager::new();
        let _held = loading.try_guard().unwrap();
        let err = loader(&store)
            .recover(&mut LinearModel::new(1, 0.1, 0.0), &loading, &tracker, None)
            .await
            .unwrap_err();
        assert_eq!(err, Error::LoadInProgress);
    }
}
