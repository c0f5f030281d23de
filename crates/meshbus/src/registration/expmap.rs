// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Map whose entries expire when not refreshed in time.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Slot<V> {
    value: V,
    refreshed_at: Instant,
}

/// Key/value map with a per-entry refresh deadline.
///
/// Every `update` resets the entry's timer. `erase_expired` removes the
/// entries whose last refresh is older than `timeout` and hands them back.
pub struct ExpiringMap<K, V> {
    timeout: Duration,
    entries: HashMap<K, Slot<V>>,
}

impl<K: Eq + Hash + Clone, V> ExpiringMap<K, V> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert or refresh. Returns the previous value, if any.
    pub fn update(&mut self, key: K, value: V) -> Option<V> {
        self.update_at(key, value, Instant::now())
    }

    pub fn update_at(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        self.entries
            .insert(
                key,
                Slot {
                    value,
                    refreshed_at: now,
                },
            )
            .map(|slot| slot.value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    pub fn erase_expired(&mut self) -> Vec<(K, V)> {
        self.erase_expired_at(Instant::now())
    }

    /// Remove entries with `refreshed_at + timeout < now`.
    pub fn erase_expired_at(&mut self, now: Instant) -> Vec<(K, V)> {
        let timeout = self.timeout;
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.refreshed_at) > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|slot| (key, slot.value)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, slot)| (k, &slot.value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|slot| &slot.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
