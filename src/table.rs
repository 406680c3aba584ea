// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Mutex-guarded id-to-object tables.
//!
//! Every lookup table in the renderer (devices, contexts, resources, BOs,
//! hardware contexts, fences) has the same shape: a small map from an
//! integer id to a shared, immutable-after-insert object. Lookup hands out
//! a clone of the `Arc` so the object stays alive after the lock is
//! released, which lets a handler keep using a context while another
//! thread concurrently erases it from the table.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

pub struct HandleTable<K, V> {
    map: Mutex<HashMap<K, Arc<V>>>,
}

impl<K: Eq + Hash, V> HandleTable<K, V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a shared reference to the value, keeping it alive past the
    /// lock release.
    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        self.map.lock().unwrap().get(key).cloned()
    }

    /// Inserts `value` unless `key` is already present. The uniqueness
    /// check and the insertion are atomic.
    pub fn insert(&self, key: K, value: Arc<V>) -> bool {
        use std::collections::hash_map::Entry;
        match self.map.lock().unwrap().entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(value);
                true
            }
        }
    }

    pub fn erase(&self, key: &K) -> bool {
        self.map.lock().unwrap().remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.lock().unwrap().contains_key(key)
    }

    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }

    pub fn size(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

impl<K: Eq + Hash, V> Default for HandleTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_erase() {
        let table: HandleTable<u32, String> = HandleTable::new();
        assert!(table.insert(1, Arc::new("one".into())));
        assert!(table.insert(2, Arc::new("two".into())));
        assert_eq!(table.size(), 2);

        let v = table.lookup(&1).unwrap();
        assert_eq!(*v, "one");
        assert!(table.lookup(&3).is_none());

        assert!(table.erase(&1));
        assert!(!table.erase(&1));
        assert!(!table.contains(&1));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let table: HandleTable<u32, u32> = HandleTable::new();
        assert!(table.insert(7, Arc::new(1)));
        assert!(!table.insert(7, Arc::new(2)));
        // The original value survives a rejected insert.
        assert_eq!(*table.lookup(&7).unwrap(), 1);
    }

    #[test]
    fn test_lookup_outlives_erase() {
        let table: HandleTable<u64, Vec<u8>> = HandleTable::new();
        table.insert(42, Arc::new(vec![1, 2, 3]));
        let held = table.lookup(&42).unwrap();
        table.erase(&42);
        // The erased entry is still usable through the shared reference.
        assert_eq!(held.len(), 3);
    }

    #[test]
    fn test_clear() {
        let table: HandleTable<u32, u32> = HandleTable::new();
        for i in 0..10 {
            table.insert(i, Arc::new(i));
        }
        table.clear();
        assert_eq!(table.size(), 0);
        assert!(!table.contains(&0));
    }
}
