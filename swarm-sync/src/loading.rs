//! Single-writer guard around model loads
//!
//! At most one load or restore runs per process. Round coordination
//! checks [`ModelLoadingManager::is_loading`] and defers instead of
//! starting a round on top of a half-restored model.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct LoadState {
    is_loading: bool,
    last_loaded_epoch: Option<u64>,
}

/// Mutual-exclusion guard for model loads; clones share state
#[derive(Debug, Clone, Default)]
pub struct ModelLoadingManager {
    state: Arc<Mutex<LoadState>>,
}

impl ModelLoadingManager {
    /// Create an idle manager
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the load slot; `false` when a load is already in flight
    pub fn try_begin_load(&self) -> bool {
        let mut state = self.state();
        if state.is_loading {
            return false;
        }
        state.is_loading = true;
        true
    }

    /// Release the load slot, recording `epoch` when the load succeeded
    pub fn end_load(&self, success: bool, epoch: Option<u64>) {
        let mut state = self.state();
        state.is_loading = false;
        if success {
            if let Some(epoch) = epoch {
                state.last_loaded_epoch = Some(epoch);
            }
        }
    }

    /// Whether a load is in flight
    pub fn is_loading(&self) -> bool {
        self.state().is_loading
    }

    /// Epoch of the last successful load
    pub fn last_loaded_epoch(&self) -> Option<u64> {
        self.state().last_loaded_epoch
    }

    /// Claim the load slot as a guard that releases it on drop
    pub fn try_guard(&self) -> Option<LoadGuard> {
        self.try_begin_load().then(|| LoadGuard {
            manager: self.clone(),
            finished: false,
        })
    }
}

/// Held while a load is in flight.
///
/// Dropping the guard without [`LoadGuard::finish`] releases the slot as a
/// failed load, so a cancelled task never leaves the manager stuck.
#[derive(Debug)]
pub struct LoadGuard {
    manager: ModelLoadingManager,
    finished: bool,
}

impl LoadGuard {
    /// Release the slot with the load's result
    pub fn finish(mut self, success: bool, epoch: Option<u64>) {
        self.finished = true;
        self.manager.end_load(success, epoch);
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.end_load(false, None);
        }
    }
}
