use std::collections::btree_map::{self, BTreeMap};

/// Ordered map from a sort key to the draw calls queued under it.
///
/// Buckets are registered explicitly; pushing to an unknown key is refused
/// so the caller decides how to handle it.
#[derive(Debug)]
pub struct BatchMap<K, D> {
    map: BTreeMap<K, Vec<D>>,
}

impl<K: Ord + Copy, D> BatchMap<K, D> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn is_batch_exist(&self, key: K) -> bool {
        self.map.contains_key(&key)
    }

    /// Registers an empty bucket. An existing bucket keeps its calls.
    pub fn add_batch(&mut self, key: K) {
        self.map.entry(key).or_default();
    }

    pub fn erase_batch(&mut self, key: K) -> Option<Vec<D>> {
        self.map.remove(&key)
    }

    /// Queues `call` under `key`, handing it back if no bucket exists.
    pub fn push(&mut self, key: K, call: D) -> Result<(), D> {
        match self.map.get_mut(&key) {
            Some(batch) => {
                batch.push(call);
                Ok(())
            }
            None => Err(call),
        }
    }

    /// Total queued calls across all buckets.
    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.values().all(Vec::is_empty)
    }

    pub fn clear_all(&mut self) {
        for batch in self.map.values_mut() {
            batch.clear();
        }
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, Vec<D>> {
        self.map.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, K, Vec<D>> {
        self.map.iter_mut()
    }
}

impl<K: Ord + Copy, D> Default for BatchMap<K, D> {
    fn default() -> Self {
        Self::new()
    }
}
