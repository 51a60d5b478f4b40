//! In-memory collaborators for testing and simulation
//!
//! Every mock is cheap to clone; clones share state, so one instance can be
//! handed to several simulated peers while the test keeps a handle for
//! injecting failures and inspecting what happened.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use swarm_sync_core::accumulator::Contribution;
use swarm_sync_core::aggregation::weighted_average;
use swarm_sync_core::group::{Group, GroupId};
use swarm_sync_core::identity::PeerId;
use swarm_sync_core::outcome::RoundReport;

use crate::traits::{ConnectionHandle, Directory, Reducer, RoundHandle, VersionedStore};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Directory
// =============================================================================

#[derive(Debug, Default)]
struct DirectoryState {
    candidates: BTreeSet<PeerId>,
    unreachable: BTreeSet<PeerId>,
    revealed_later: VecDeque<Vec<PeerId>>,
    epoch: Option<u64>,
    linked_store: Option<MemoryStore>,
    unavailable: bool,
    unresponsive: bool,
    list_calls: usize,
}

/// Mock directory with scripted reachability and consensus epoch
#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MockDirectory {
    /// Create a directory advertising `peers`, all reachable
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        let dir = Self::default();
        lock(&dir.state).candidates.extend(peers);
        dir
    }

    /// Mark a peer reachable or unreachable
    pub fn set_reachable(&self, peer: PeerId, reachable: bool) {
        let mut state = lock(&self.state);
        if reachable {
            state.unreachable.remove(&peer);
        } else {
            state.unreachable.insert(peer);
        }
    }

    /// Advertise an additional candidate
    pub fn add_candidate(&self, peer: PeerId) {
        lock(&self.state).candidates.insert(peer);
    }

    /// Stop advertising a candidate
    pub fn remove_candidate(&self, peer: &PeerId) {
        lock(&self.state).candidates.remove(peer);
    }

    /// Queue peers that appear on a later `list_candidates` call, one batch per call
    pub fn reveal_later(&self, peers: impl IntoIterator<Item = PeerId>) {
        lock(&self.state)
            .revealed_later
            .push_back(peers.into_iter().collect());
    }

    /// Fix the consensus epoch
    pub fn set_epoch(&self, epoch: Option<u64>) {
        lock(&self.state).epoch = epoch;
    }

    /// Report the store's latest tag as the consensus epoch
    pub fn link_store(&self, store: MemoryStore) {
        lock(&self.state).linked_store = Some(store);
    }

    /// Make every call fail or come back empty
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Make every call hang until cleared
    pub fn set_unresponsive(&self, unresponsive: bool) {
        lock(&self.state).unresponsive = unresponsive;
    }

    /// Number of `list_candidates` calls so far
    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    async fn stall(&self) {
        let unresponsive = lock(&self.state).unresponsive;
        if unresponsive {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait::async_trait]
impl Directory for MockDirectory {
    async fn resolve(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        self.stall().await;
        let state = lock(&self.state);
        if state.unavailable || state.unreachable.contains(peer) {
            return None;
        }
        Some(ConnectionHandle {
            peer_id: *peer,
            address: format!("mem://{peer}"),
        })
    }

    async fn list_candidates(&self) -> Vec<PeerId> {
        lock(&self.state).list_calls += 1;
        self.stall().await;
        let mut state = lock(&self.state);
        if state.unavailable {
            return Vec::new();
        }
        if let Some(batch) = state.revealed_later.pop_front() {
            state.candidates.extend(batch);
        }
        state.candidates.iter().copied().collect()
    }

    async fn current_consensus_epoch(&self) -> Result<Option<u64>> {
        self.stall().await;
        let state = lock(&self.state);
        if state.unavailable {
            return Err(Error::Unavailable("directory offline".into()));
        }
        match &state.linked_store {
            Some(store) => Ok(store.latest_tag()),
            None => Ok(state.epoch),
        }
    }
}

// =============================================================================
// Reducer
// =============================================================================

/// Scripted behavior of a [`MockReducer`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReducerBehavior {
    /// Finish immediately
    Complete,
    /// Finish after `done()` has been polled this many times
    CompleteAfter(usize),
    /// Never finish
    Never,
    /// `begin_round` fails
    FailBegin(String),
    /// The handle finishes but `result()` fails
    FailResult(String),
    /// `begin_round` panics
    Panic,
    /// `begin_round` never returns
    Unresponsive,
}

/// Reducer that averages only the local contribution, with scripted behavior
#[derive(Debug, Clone)]
pub struct MockReducer {
    behavior: ReducerBehavior,
    failed_peers: Vec<PeerId>,
    contributions: Arc<Mutex<Vec<Contribution>>>,
    cancel_calls: Arc<AtomicUsize>,
}

impl MockReducer {
    /// Create a reducer with the given behavior
    pub fn new(behavior: ReducerBehavior) -> Self {
        Self {
            behavior,
            failed_peers: Vec::new(),
            contributions: Arc::new(Mutex::new(Vec::new())),
            cancel_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report these peers as failed in every successful round they belong to
    pub fn with_failed_peers(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.failed_peers = peers.into_iter().collect();
        self
    }

    /// Contributions handed to `begin_round`, in call order
    pub fn contributions(&self) -> Vec<Contribution> {
        lock(&self.contributions).clone()
    }

    /// Total `cancel()` calls across all handles
    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Reducer for MockReducer {
    type Handle = MockHandle;

    async fn begin_round(&self, group: &Group, contribution: Contribution) -> Result<MockHandle> {
        match &self.behavior {
            ReducerBehavior::FailBegin(reason) => return Err(Error::Reduction(reason.clone())),
            ReducerBehavior::Panic => panic!("reduction backend crashed"),
            ReducerBehavior::Unresponsive => return std::future::pending().await,
            _ => {}
        }

        let reduction_result = weighted_average(std::slice::from_ref(&contribution))
            .map_err(|e| Error::Reduction(e.to_string()))?;
        lock(&self.contributions).push(contribution);

        let report = RoundReport {
            participating_peers: group.peer_ids().to_vec(),
            failed_peers: self
                .failed_peers
                .iter()
                .filter(|p| group.contains(p))
                .copied()
                .collect(),
            reduction_result,
        };
        Ok(MockHandle {
            behavior: self.behavior.clone(),
            polls: AtomicUsize::new(0),
            cancelled: false,
            report,
            cancel_calls: Arc::clone(&self.cancel_calls),
        })
    }
}

/// Handle produced by [`MockReducer`]
#[derive(Debug)]
pub struct MockHandle {
    behavior: ReducerBehavior,
    polls: AtomicUsize,
    cancelled: bool,
    report: RoundReport,
    cancel_calls: Arc<AtomicUsize>,
}

impl MockHandle {
    fn finished(&self) -> bool {
        match self.behavior {
            ReducerBehavior::Never => false,
            ReducerBehavior::CompleteAfter(n) => self.polls.load(Ordering::SeqCst) >= n,
            _ => true,
        }
    }
}

impl RoundHandle for MockHandle {
    fn done(&self) -> bool {
        if self.cancelled {
            return true;
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.finished()
    }

    fn cancel(&mut self) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if !self.finished() {
            self.cancelled = true;
        }
    }

    fn result(&mut self) -> Result<RoundReport> {
        if self.cancelled {
            return Err(Error::Reduction("round cancelled".into()));
        }
        if !self.finished() {
            return Err(Error::Reduction("round still running".into()));
        }
        match &self.behavior {
            ReducerBehavior::FailResult(reason) => Err(Error::Reduction(reason.clone())),
            _ => Ok(self.report.clone()),
        }
    }
}

// =============================================================================
// Rendezvous reducer
// =============================================================================

#[derive(Debug, Default)]
struct Session {
    expected: Vec<PeerId>,
    contributions: BTreeMap<PeerId, Contribution>,
    collected: BTreeSet<PeerId>,
}

impl Session {
    fn complete(&self) -> bool {
        self.contributions.len() == self.expected.len()
    }
}

/// Reducer shared by in-process peers.
///
/// A round completes once every member of the group has called
/// `begin_round` with the same group id; every member then receives the
/// same sample-weighted average. A member that never shows up stalls the
/// round until the callers' deadlines cancel it.
#[derive(Debug, Clone, Default)]
pub struct RendezvousReducer {
    sessions: Arc<Mutex<HashMap<GroupId, Session>>>,
}

impl RendezvousReducer {
    /// Create an empty rendezvous point
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounds that still have members outstanding or results uncollected
    pub fn open_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }
}

#[async_trait::async_trait]
impl Reducer for RendezvousReducer {
    type Handle = RendezvousHandle;

    async fn begin_round(
        &self,
        group: &Group,
        contribution: Contribution,
    ) -> Result<RendezvousHandle> {
        let peer = contribution.contributor;
        if !group.contains(&peer) {
            return Err(Error::Reduction(format!("{peer} is not a member of the group")));
        }
        let mut sessions = lock(&self.sessions);
        let session = sessions.entry(*group.group_id()).or_insert_with(|| Session {
            expected: group.peer_ids().to_vec(),
            ..Session::default()
        });
        session.contributions.insert(peer, contribution);
        tracing::trace!(
            group = %group.group_id(),
            arrived = session.contributions.len(),
            expected = session.expected.len(),
            "rendezvous contribution"
        );
        Ok(RendezvousHandle {
            group_id: *group.group_id(),
            peer,
            cancelled: false,
            sessions: Arc::clone(&self.sessions),
        })
    }
}

/// Handle produced by [`RendezvousReducer`]
#[derive(Debug)]
pub struct RendezvousHandle {
    group_id: GroupId,
    peer: PeerId,
    cancelled: bool,
    sessions: Arc<Mutex<HashMap<GroupId, Session>>>,
}

impl RoundHandle for RendezvousHandle {
    fn done(&self) -> bool {
        if self.cancelled {
            return true;
        }
        lock(&self.sessions)
            .get(&self.group_id)
            .map_or(true, Session::complete)
    }

    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.get_mut(&self.group_id) else {
            return;
        };
        if session.complete() {
            return;
        }
        self.cancelled = true;
        session.contributions.remove(&self.peer);
        if session.contributions.is_empty() {
            sessions.remove(&self.group_id);
        }
    }

    fn result(&mut self) -> Result<RoundReport> {
        if self.cancelled {
            return Err(Error::Reduction("round cancelled".into()));
        }
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(&self.group_id)
            .ok_or_else(|| Error::Reduction("round session vanished".into()))?;
        if !session.complete() {
            return Err(Error::Reduction("round still running".into()));
        }

        let contributions: Vec<Contribution> = session.contributions.values().cloned().collect();
        let reduction_result =
            weighted_average(&contributions).map_err(|e| Error::Reduction(e.to_string()))?;
        let report = RoundReport {
            participating_peers: session.expected.clone(),
            failed_peers: Vec::new(),
            reduction_result,
        };

        session.collected.insert(self.peer);
        if session.collected.len() == session.expected.len() {
            sessions.remove(&self.group_id);
        }
        Ok(report)
    }
}

// =============================================================================
// Versioned store
// =============================================================================

/// Fault injected into the next [`MemoryStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutFault {
    /// The upload itself fails; nothing is stored
    Upload,
    /// The upload lands but tag creation fails; the blob is orphaned
    TagCreation,
    /// The call times out before anything is stored
    Timeout,
}

#[derive(Debug)]
struct StoredTag {
    upload: usize,
    commit_message: String,
}

#[derive(Debug, Default)]
struct StoreState {
    uploads: Vec<Vec<u8>>,
    tags: BTreeMap<u64, StoredTag>,
    put_faults: VecDeque<PutFault>,
    get_failures: u32,
    list_failures: u32,
    stale_listing: bool,
    put_calls: usize,
    get_calls: usize,
}

/// Append-only in-memory store with failure injection
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest tag present
    pub fn latest_tag(&self) -> Option<u64> {
        lock(&self.state).tags.keys().next_back().copied()
    }

    /// All tags in ascending order, ignoring injected faults
    pub fn tags(&self) -> Vec<u64> {
        lock(&self.state).tags.keys().copied().collect()
    }

    /// Commit message recorded for `tag`
    pub fn commit_message(&self, tag: u64) -> Option<String> {
        lock(&self.state)
            .tags
            .get(&tag)
            .map(|t| t.commit_message.clone())
    }

    /// Blobs uploaded without a tag pointing at them
    pub fn orphaned_uploads(&self) -> usize {
        let state = lock(&self.state);
        state.uploads.len() - state.tags.len()
    }

    /// Queue a fault for the next `put`
    pub fn fail_next_put(&self, fault: PutFault) {
        lock(&self.state).put_faults.push_back(fault);
    }

    /// Fail the next `n` reads
    pub fn fail_next_gets(&self, n: u32) {
        lock(&self.state).get_failures = n;
    }

    /// Fail the next `n` listings
    pub fn fail_next_lists(&self, n: u32) {
        lock(&self.state).list_failures = n;
    }

    /// Leave the newest tag out of listings, as an eventually consistent store might
    pub fn set_stale_listing(&self, stale: bool) {
        lock(&self.state).stale_listing = stale;
    }

    /// Rewrite the blob behind `tag` in place
    pub fn tamper(&self, tag: u64, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let mut state = lock(&self.state);
        let Some(upload) = state.tags.get(&tag).map(|t| t.upload) else {
            return false;
        };
        f(&mut state.uploads[upload]);
        true
    }

    /// Number of `put` calls so far
    pub fn put_calls(&self) -> usize {
        lock(&self.state).put_calls
    }

    /// Number of `get` calls so far
    pub fn get_calls(&self) -> usize {
        lock(&self.state).get_calls
    }
}

#[async_trait::async_trait]
impl VersionedStore for MemoryStore {
    async fn put(&self, tag: u64, blob: Vec<u8>, commit_message: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.put_calls += 1;
        let fault = state.put_faults.pop_front();
        match fault {
            Some(PutFault::Upload) => return Err(Error::Unavailable("upload failed".into())),
            Some(PutFault::Timeout) => return Err(Error::Timeout),
            _ => {}
        }
        if state.tags.contains_key(&tag) {
            return Err(Error::TagExists { tag });
        }

        state.uploads.push(blob);
        let upload = state.uploads.len() - 1;
        if fault == Some(PutFault::TagCreation) {
            return Err(Error::Unavailable("tag creation failed".into()));
        }
        state.tags.insert(
            tag,
            StoredTag {
                upload,
                commit_message: commit_message.to_owned(),
            },
        );
        Ok(())
    }

    async fn get(&self, tag: u64) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        state.get_calls += 1;
        if state.get_failures > 0 {
            state.get_failures -= 1;
            return Err(Error::Unavailable("read failed".into()));
        }
        let upload = state
            .tags
            .get(&tag)
            .map(|t| t.upload)
            .ok_or(Error::NotFound { tag })?;
        Ok(state.uploads[upload].clone())
    }

    async fn list_tags(&self) -> Result<Vec<u64>> {
        let mut state = lock(&self.state);
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(Error::Unavailable("listing failed".into()));
        }
        let mut tags: Vec<u64> = state.tags.keys().copied().collect();
        if state.stale_listing {
            tags.pop();
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8) -> PeerId {
        PeerId::new([id; 32])
    }

    fn contribution(id: u8, value: f32, samples: u64) -> Contribution {
        Contribution {
            contributor: peer(id),
            gradients: vec![value],
            samples,
        }
    }

    #[tokio::test]
    async fn directory_resolves_only_reachable_peers() {
        let dir = MockDirectory::new([peer(1), peer(2)]);
        dir.set_reachable(peer(2), false);
        assert!(dir.resolve(&peer(1)).await.is_some());
        assert!(dir.resolve(&peer(2)).await.is_none());

        dir.set_reachable(peer(2), true);
        assert!(dir.resolve(&peer(2)).await.is_some());
    }

    #[tokio::test]
    async fn directory_reveals_candidates_over_time() {
        let dir = MockDirectory::new([peer(1)]);
        dir.reveal_later([peer(2)]);
        assert_eq!(dir.list_candidates().await, vec![peer(1), peer(2)]);
        assert_eq!(dir.list_calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_directory_fails_softly() {
        let dir = MockDirectory::new([peer(1)]);
        dir.set_unavailable(true);
        assert!(dir.list_candidates().await.is_empty());
        assert!(dir.resolve(&peer(1)).await.is_none());
        assert!(dir.current_consensus_epoch().await.is_err());
    }

    #[tokio::test]
    async fn linked_directory_follows_the_store() {
        let store = MemoryStore::new();
        let dir = MockDirectory::default();
        dir.link_store(store.clone());
        assert_eq!(dir.current_consensus_epoch().await, Ok(None));
        store.put(3, vec![1], "Epoch 3.").await.unwrap();
        assert_eq!(dir.current_consensus_epoch().await, Ok(Some(3)));
    }

    #[tokio::test]
    async fn mock_handle_cancel_is_idempotent() {
        let reducer = MockReducer::new(ReducerBehavior::Never);
        let group = Group::derive(0, [peer(1), peer(2)]);
        let mut handle = reducer.begin_round(&group, contribution(1, 1.0, 1)).await.unwrap();
        assert!(!handle.done());
        handle.cancel();
        handle.cancel();
        assert!(handle.done());
        assert!(handle.result().is_err());
        assert_eq!(reducer.cancel_calls(), 2);
    }

    #[tokio::test]
    async fn cancel_on_finished_handle_is_a_no_op() {
        let reducer = MockReducer::new(ReducerBehavior::Complete);
        let group = Group::derive(0, [peer(1)]);
        let mut handle = reducer.begin_round(&group, contribution(1, 2.0, 4)).await.unwrap();
        handle.cancel();
        let report = handle.result().unwrap();
        assert_eq!(report.reduction_result.gradients, vec![2.0]);
    }

    #[tokio::test]
    async fn complete_after_counts_polls() {
        let reducer = MockReducer::new(ReducerBehavior::CompleteAfter(3));
        let group = Group::derive(0, [peer(1)]);
        let handle = reducer.begin_round(&group, contribution(1, 0.0, 1)).await.unwrap();
        assert!(!handle.done());
        assert!(!handle.done());
        assert!(handle.done());
    }

    #[tokio::test]
    async fn rendezvous_waits_for_every_member() {
        let reducer = RendezvousReducer::new();
        let group = Group::derive(9, [peer(1), peer(2)]);

        let mut a = reducer.begin_round(&group, contribution(1, 1.0, 1)).await.unwrap();
        assert!(!a.done());
        let mut b = reducer.begin_round(&group, contribution(2, 4.0, 3)).await.unwrap();
        assert!(a.done() && b.done());

        let ra = a.result().unwrap();
        let rb = b.result().unwrap();
        assert_eq!(ra, rb);
        assert_eq!(ra.reduction_result.samples, 4);
        assert!((ra.reduction_result.gradients[0] - 3.25).abs() < 1e-6);
        assert_eq!(reducer.open_sessions(), 0);
    }

    #[tokio::test]
    async fn rendezvous_cancel_withdraws_contribution() {
        let reducer = RendezvousReducer::new();
        let group = Group::derive(9, [peer(1), peer(2)]);
        let mut a = reducer.begin_round(&group, contribution(1, 1.0, 1)).await.unwrap();
        a.cancel();
        assert_eq!(reducer.open_sessions(), 0);
        assert!(a.result().is_err());
    }

    #[tokio::test]
    async fn rendezvous_rejects_non_members() {
        let reducer = RendezvousReducer::new();
        let group = Group::derive(9, [peer(1), peer(2)]);
        assert!(reducer
            .begin_round(&group, contribution(3, 1.0, 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn store_is_append_only() {
        let store = MemoryStore::new();
        store.put(1, vec![1], "one").await.unwrap();
        assert_eq!(
            store.put(1, vec![2], "again").await,
            Err(Error::TagExists { tag: 1 })
        );
        assert_eq!(store.get(1).await.unwrap(), vec![1]);
        assert_eq!(store.commit_message(1).as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn failed_tag_creation_leaves_no_visible_tag() {
        let store = MemoryStore::new();
        store.fail_next_put(PutFault::TagCreation);
        assert!(store.put(2, vec![7], "two").await.is_err());
        assert_eq!(store.list_tags().await.unwrap(), Vec::<u64>::new());
        assert_eq!(store.orphaned_uploads(), 1);

        store.put(2, vec![7], "two").await.unwrap();
        assert_eq!(store.list_tags().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn injected_read_failures_are_consumed() {
        let store = MemoryStore::new();
        store.put(1, vec![1], "one").await.unwrap();
        store.fail_next_gets(2);
        assert!(store.get(1).await.is_err());
        assert!(store.get(1).await.is_err());
        assert!(store.get(1).await.is_ok());
        assert_eq!(store.get(5).await, Err(Error::NotFound { tag: 5 }));
    }

    #[tokio::test]
    async fn stale_listing_hides_the_newest_tag() {
        let store = MemoryStore::new();
        store.put(1, vec![], "one").await.unwrap();
        store.put(2, vec![], "two").await.unwrap();
        store.set_stale_listing(true);
        assert_eq!(store.list_tags().await.unwrap(), vec![1]);
        assert_eq!(store.latest_tag(), Some(2));
    }
}
