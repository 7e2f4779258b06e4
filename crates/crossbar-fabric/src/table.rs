//! Learning tables — which link an address was first seen arriving on.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

use crate::link::LinkId;

/// Lazily-populated address → link map, shared between the listener
/// adapters (which insert) and the dispatcher (which looks up).
///
/// Addresses are stationary for the lifetime of a run, so the first
/// observation wins and entries are never evicted. Keyed on node ID at a
/// local switch and on network ID at the central switch.
#[derive(Clone)]
pub struct LearningTable<K: Eq + Hash> {
    entries: Arc<DashMap<K, LinkId>>,
}

impl<K: Eq + Hash + Copy> LearningTable<K> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Record that `key` was observed as a source on `link`.
    /// First write wins; later observations are no-ops.
    pub fn learn(&self, key: K, link: LinkId) {
        self.entries.entry(key).or_insert(link);
    }

    /// The link `key` was learned on, if any.
    pub fn lookup(&self, key: K) -> Option<LinkId> {
        self.entries.get(&key).map(|e| *e.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Copy> Default for LearningTable<K> {
    fn default() -> Self {
        Self::new()
    }
}
