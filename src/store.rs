//! The in-memory key-value map backing the replicated state machine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared handle to the KV map.
///
/// Mutations only ever arrive through the raft apply path, which is
/// single-threaded; the lock exists so read-side RPC handlers and the
/// snapshot dump can take brief consistent views. No lock is held across
/// an await point.
#[derive(Clone, Default)]
pub struct KvStore {
    pairs: Arc<RwLock<HashMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.pairs.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: String, value: String) {
        self.pairs.write().unwrap().insert(key, value);
    }

    /// Removes a key. Deleting a missing key is a successful no-op.
    pub fn delete(&self, key: &str) {
        self.pairs.write().unwrap().remove(key);
    }

    pub fn all(&self) -> Vec<(String, String)> {
        self.pairs
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.read().unwrap().is_empty()
    }

    /// Clones the whole map under the lock. Serialization happens on the
    /// caller's side, outside the exclusive section.
    pub fn dump(&self) -> HashMap<String, String> {
        self.pairs.read().unwrap().clone()
    }

    /// Atomically replaces the map; used by snapshot restore.
    pub fn replace(&self, pairs: HashMap<String, String>) {
        *self.pairs.write().unwrap() = pairs;
    }

    pub fn shutdown(&self) {
        log::debug!("store: closing key-value store with {} pairs", self.len());
    }
}
