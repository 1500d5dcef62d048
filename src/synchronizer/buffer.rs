//! Pending-stage buffers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::apisix::ApisixConfiguration;

/// Stage key → not-yet-flushed desired configuration.
#[derive(Debug, Default)]
pub struct StageBuffer {
    entries: DashMap<String, ApisixConfiguration>,
}

impl StageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `config` for `stage_key`, replacing any pending entry.
    pub fn put(&self, stage_key: String, config: ApisixConfiguration) {
        self.entries.insert(stage_key, config);
    }

    /// Store `config` only if nothing is pending for `stage_key`.
    pub fn put_if_absent(&self, stage_key: String, config: ApisixConfiguration) -> bool {
        match self.entries.entry(stage_key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(config);
                true
            }
        }
    }

    pub fn get(&self, stage_key: &str) -> Option<ApisixConfiguration> {
        self.entries.get(stage_key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, stage_key: &str) -> bool {
        self.entries.contains_key(stage_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every pending entry.
    pub fn drain(&self) -> HashMap<String, ApisixConfiguration> {
        let keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }
}

/// Two stage buffers, one of which receives writes.
///
/// Writers hold the index lock only while inserting, so a swap never
/// interleaves with a half-finished write into the slot being retired.
#[derive(Debug, Default)]
pub struct DoubleBuffer {
    slots: [StageBuffer; 2],
    active: Mutex<usize>,
}

impl DoubleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the active buffer while it cannot be swapped out.
    pub fn with_active<T>(&self, f: impl FnOnce(&StageBuffer) -> T) -> T {
        let active = self.lock();
        f(&self.slots[*active])
    }

    /// Make the other slot active and return the retired one.
    pub fn swap(&self) -> &StageBuffer {
        let mut active = self.lock();
        let retired = *active;
        *active = 1 - retired;
        &self.slots[retired]
    }

    /// Entries pending across both slots.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(StageBuffer::len).sum()
    }
}
