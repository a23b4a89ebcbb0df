//! Process-local cache of prepared queries.
//!
//! Entries are keyed by policy identity and never age out; a propagated
//! change purges the whole cache. Every purge bumps a generation counter so a
//! compile that started before the purge cannot reinsert a query built from
//! the old source.

use std::collections::HashMap;
use std::sync::Arc;

use octopolicy_core::PolicyId;
use parking_lot::RwLock;

use crate::runtime::PreparedQuery;

#[derive(Default)]
struct CacheState {
    entries: HashMap<PolicyId, Arc<dyn PreparedQuery>>,
    generation: u64,
}

#[derive(Default)]
pub struct QueryCache {
    state: RwLock<CacheState>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PolicyId) -> Option<Arc<dyn PreparedQuery>> {
        self.state.read().entries.get(id).cloned()
    }

    pub fn set(&self, id: PolicyId, query: Arc<dyn PreparedQuery>) {
        self.state.write().entries.insert(id, query);
    }

    /// Insert only if no purge happened since `generation` was read.
    ///
    /// Returns `false` when the entry was dropped.
    pub fn set_if_generation(
        &self,
        id: PolicyId,
        query: Arc<dyn PreparedQuery>,
        generation: u64,
    ) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            return false;
        }
        state.entries.insert(id, query);
        true
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Drop every entry.
    pub fn purge(&self) -> usize {
        let mut state = self.state.write();
        state.generation += 1;
        let purged = state.entries.len();
        state.entries.clear();
        purged
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("QueryCache")
            .field("entries", &state.entries.len())
            .field("generation", &state.generation)
            .finish()
    }
}
