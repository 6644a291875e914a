use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::entry::{CacheEntry, Staleness};
use crate::key::CacheKey;

/// Write-behind persistence hook. `schedule_write` is pinged whenever
/// persistable cache content changed; the actual write may be delayed and
/// batched by the embedder.
pub trait PersistenceDelegate {
    fn schedule_write(&self);
}

/// Bounded map from [`CacheKey`] to [`CacheEntry`] with TTL and
/// network-generation staleness.
///
/// Entries are never removed by the passage of time or by network
/// changes; they merely become stale and are preferred for eviction once
/// the capacity is reached. A capacity of zero disables caching entirely.
pub struct HostCache {
    entries: BTreeMap<CacheKey, CacheEntry>,
    max_entries: usize,
    network_generation: u64,
    next_insertion_index: u64,
    restore_size: usize,
    eviction_callback: Option<Box<dyn FnMut(&CacheKey, &CacheEntry)>>,
    persistence: Option<Box<dyn PersistenceDelegate>>,
}

pub(crate) const DEFAULT_MAX_ENTRIES: usize = 1000;

impl Default for HostCache {
    fn default() -> Self {
        HostCache::new(DEFAULT_MAX_ENTRIES)
    }
}

impl HostCache {
    pub fn new(max_entries: usize) -> Self {
        HostCache {
            entries: BTreeMap::new(),
            max_entries,
            network_generation: 0,
            next_insertion_index: 0,
            restore_size: 0,
            eviction_callback: None,
            persistence: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn network_generation(&self) -> u64 {
        self.network_generation
    }

    fn caching_enabled(&self) -> bool {
        self.max_entries > 0
    }

    /// Invoked with every entry evicted for capacity.
    pub fn set_eviction_callback(
        &mut self,
        callback: impl FnMut(&CacheKey, &CacheEntry) + 'static,
    ) {
        self.eviction_callback = Some(Box::new(callback));
    }

    pub fn set_persistence_delegate(&mut self, delegate: impl PersistenceDelegate + 'static) {
        self.persistence = Some(Box::new(delegate));
    }

    /// The entry for `key` iff it is fresh at `now`. Counts a hit.
    pub fn lookup(&mut self, key: &CacheKey, now: Instant) -> Option<&CacheEntry> {
        if !self.caching_enabled() {
            return None;
        }
        let network_generation = self.network_generation;
        let entry = self.entries.get_mut(key)?;
        if entry.is_stale(now, network_generation) {
            return None;
        }
        entry.count_hit(false);
        Some(&*entry)
    }

    /// The entry for `key` regardless of staleness, together with how
    /// stale it was before this lookup. Counts a (possibly stale) hit.
    pub fn lookup_stale(
        &mut self,
        key: &CacheKey,
        now: Instant,
    ) -> Option<(&CacheEntry, Staleness)> {
        if !self.caching_enabled() {
            return None;
        }
        let network_generation = self.network_generation;
        let entry = self.entries.get_mut(key)?;
        let staleness = entry.staleness(now, network_generation);
        entry.count_hit(staleness.is_stale());
        Some((&*entry, staleness))
    }

    /// Inserts or overwrites the entry for `key`, expiring `ttl` from
    /// `now`. A `ttl` of zero is legal: the entry starts out stale and
    /// exists only for stale-serving fallback. Evicts one entry when a
    /// new key would exceed capacity.
    pub fn set(&mut self, key: CacheKey, entry: CacheEntry, now: Instant, ttl: Duration) {
        if !self.caching_enabled() {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_one();
        }
        let insertion_index = self.next_insertion_index;
        self.next_insertion_index += 1;
        let stored = entry.prepare_for_cache(now, ttl, self.network_generation, insertion_index);
        self.entries.insert(key, stored);
        self.schedule_write();
    }

    // Evicts the entry expiring soonest; ties prefer the one cached the
    // most network changes ago, then the lowest insertion index.
    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| {
                (
                    entry.expires(),
                    entry.network_generation(),
                    entry.insertion_index(),
                )
            })
            .map(|(key, _)| key.clone());
        let Some(key) = victim else { return };
        let entry = self.entries.remove(&key).expect("victim key is present");
        tracing::debug!(host = %key.host, "evicting cache entry for capacity");
        if let Some(callback) = self.eviction_callback.as_mut() {
            callback(&key, &entry);
        }
    }

    /// Marks every entry stale on account of a network change.
    pub fn on_network_change(&mut self) {
        self.network_generation += 1;
        tracing::debug!(
            generation = self.network_generation,
            entries = self.entries.len(),
            "network changed; all cache entries now stale"
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.schedule_write();
    }

    /// Removes every entry whose hostname satisfies `filter`.
    pub fn clear_for_hosts(&mut self, filter: impl Fn(&str) -> bool) {
        let before = self.entries.len();
        self.entries.retain(|key, _| !filter(key.hostname()));
        if self.entries.len() != before {
            tracing::debug!(
                removed = before - self.entries.len(),
                "cleared cache entries by host filter"
            );
            self.schedule_write();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry)> {
        self.entries.iter()
    }

    /// Entries restored by the most recent [`restore`](Self::restore).
    pub fn last_restore_size(&self) -> usize {
        self.restore_size
    }

    pub(crate) fn schedule_write(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.schedule_write();
        }
    }

    pub(crate) fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn insert_restored(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    pub(crate) fn set_restore_size(&mut self, restore_size: usize) {
        self.restore_size = restore_size;
    }

    pub(crate) fn generation_and_next_index(&mut self) -> (u64, u64) {
        let index = self.next_insertion_index;
        self.next_insertion_index += 1;
        (self.network_generation, index)
    }
}
