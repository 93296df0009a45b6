use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chord_util::{self, RingKey};
use crate::error::{Error, Result};

/// A stored value. `name` is the operator-facing key string the ring key was
/// hashed from, kept only for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub value: String,
}

impl Entry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Entry {
        Entry { name: name.into(), value: value.into() }
    }
}

/// Key/value pairs ordered by ring key.
#[derive(Debug, Clone, Default)]
pub struct DataStore {
    stored_data: BTreeMap<RingKey, Entry>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore { stored_data: BTreeMap::new() }
    }

    pub fn get(&self, key: &RingKey) -> Result<Entry> {
        self.stored_data
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Returns true when an existing value was replaced.
    pub fn set(&mut self, key: RingKey, entry: Entry) -> bool {
        self.stored_data.insert(key, entry).is_some()
    }

    pub fn delete(&mut self, key: &RingKey) -> Result<Entry> {
        self.stored_data
            .remove(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Entries whose key lies in the circular interval `(lo, hi]`.
    pub fn entries_in_range(&self, lo: &RingKey, hi: &RingKey) -> Vec<(RingKey, Entry)> {
        if lo == hi {
            return self.entries();
        }
        let pick = |(k, v): (&RingKey, &Entry)| (*k, v.clone());
        if lo < hi {
            self.stored_data
                .range((std::ops::Bound::Excluded(*lo), std::ops::Bound::Included(*hi)))
                .map(pick)
                .collect()
        } else {
            // wraps past the origin: (lo, MAX] followed by [0, hi]
            self.stored_data
                .range((std::ops::Bound::Excluded(*lo), std::ops::Bound::Unbounded))
                .chain(self.stored_data.range(..=*hi))
                .map(pick)
                .collect()
        }
    }

    /// Removes and returns the entries of `(lo, hi]`.
    pub fn remove_range(&mut self, lo: &RingKey, hi: &RingKey) -> Vec<(RingKey, Entry)> {
        let taken = self.entries_in_range(lo, hi);
        for (key, _) in &taken {
            self.stored_data.remove(key);
        }
        taken
    }

    /// Removes and returns every entry outside the ownership interval
    /// `(pred, self_key]`.
    pub fn drain_outside(&mut self, pred: &RingKey, self_key: &RingKey) -> Vec<(RingKey, Entry)> {
        let misplaced: Vec<RingKey> = self
            .stored_data
            .keys()
            .filter(|k| !chord_util::in_half_open(k, pred, self_key))
            .copied()
            .collect();
        misplaced
            .into_iter()
            .filter_map(|k| self.stored_data.remove(&k).map(|e| (k, e)))
            .collect()
    }

    pub fn entries(&self) -> Vec<(RingKey, Entry)> {
        self.stored_data.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.stored_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored_data.is_empty()
    }

    pub fn clear(&mut self) {
        self.stored_data.clear();
    }
}

/// Store operations the protocol needs, independent of how the store is
/// locked.
pub trait KeyOwnership: Send + Sync {
    fn get(&self, key: &RingKey) -> Result<Entry>;
    fn set(&self, key: RingKey, entry: Entry) -> bool;
    fn delete(&self, key: &RingKey) -> Result<Entry>;
    fn entries_in_range(&self, lo: &RingKey, hi: &RingKey) -> Vec<(RingKey, Entry)>;
    fn remove_range(&self, lo: &RingKey, hi: &RingKey) -> Vec<(RingKey, Entry)>;
    fn drain_outside(&self, pred: &RingKey, self_key: &RingKey) -> Vec<(RingKey, Entry)>;
    fn entries(&self) -> Vec<(RingKey, Entry)>;
    fn len(&self) -> usize;
    fn clear(&self);
}

pub struct SharedStore {
    store: Mutex<DataStore>,
}

impl SharedStore {
    pub fn new() -> SharedStore {
        SharedStore { store: Mutex::new(DataStore::new()) }
    }
}

impl Default for SharedStore {
    fn default() -> SharedStore {
        SharedStore::new()
    }
}

impl KeyOwnership for SharedStore {
    fn get(&self, key: &RingKey) -> Result<Entry> {
        self.store.lock().get(key)
    }

    fn set(&self, key: RingKey, entry: Entry) -> bool {
        self.store.lock().set(key, entry)
    }

    fn delete(&self, key: &RingKey) -> Result<Entry> {
        self.store.lock().delete(key)
    }

    fn entries_in_range(&self, lo: &RingKey, hi: &RingKey) -> Vec<(RingKey, Entry)> {
        self.store.lock().entries_in_range(lo, hi)
    }

    fn remove_range(&self, lo: &RingKey, hi: &RingKey) -> Vec<(RingKey, Entry)> {
        self.store.lock().remove_range(lo, hi)
    }

    fn drain_outside(&self, pred: &RingKey, self_key: &RingKey) -> Vec<(RingKey, Entry)> {
        self.store.lock().drain_outside(pred, self_key)
    }

    fn entries(&self) -> Vec<(RingKey, Entry)> {
        self.store.lock().entries()
    }

    fn len(&self) -> usize {
        self.store.lock().len()
    }

    fn clear(&self) {
        self.store.lock().clear();
    }
}
