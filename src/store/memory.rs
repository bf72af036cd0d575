//! In-memory checkpoint store for tests and dry runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::search::state::SearchState;
use crate::store::{CheckpointStore, StoreError};

/// Keeps every checkpoint ever saved. Clones share the same history.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    saved: Arc<Mutex<Vec<SearchState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SearchState>> {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every checkpoint in save order.
    pub fn history(&self) -> Vec<SearchState> {
        self.lock().clone()
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&mut self, state: &SearchState) -> Result<(), StoreError> {
        state.check_partition()?;
        self.lock().push(state.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<SearchState>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .filter(|s| s.run_id == run_id)
            .max_by_key(|s| s.sequence)
            .cloned())
    }

    fn discard(&mut self, run_id: &str) -> Result<usize, StoreError> {
        let mut saved = self.lock();
        let before = saved.len();
        saved.retain(|s| s.run_id != run_id);
        Ok(before - saved.len())
    }
}
