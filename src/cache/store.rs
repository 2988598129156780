//! In-memory keyed storage with lazy TTL expiry
//!
//! Provides a `CacheStore` that holds fetched values for a fixed time-to-live.
//! Expired entries are reported as misses and left in place until they are
//! overwritten, invalidated, or pushed out by the optional capacity bound.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A cached value and its bookkeeping
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    /// The cached value
    value: V,
    /// When the value was stored
    stored_at: Instant,
    /// Logical clock value of the last read or write, used for LRU eviction
    last_used: u64,
}

/// Keyed, time-bounded storage for query results
///
/// Values are opaque to the store. With `max_entries` unset (the default) the
/// store never evicts on its own; lazy expiry is the only bound.
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: HashMap<String, CacheEntry<V>>,
    ttl: Duration,
    max_entries: Option<usize>,
    tick: u64,
}

impl<V: Clone> CacheStore<V> {
    /// Creates an unbounded store with the given TTL
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: None,
            tick: 0,
        }
    }

    /// Bounds the store to `max_entries`, evicting the least recently used
    /// entry when a new key would exceed it
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    /// Returns the configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn fresh_at(entry: &CacheEntry<V>, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(entry.stored_at) < ttl
    }

    fn is_fresh(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        Self::fresh_at(entry, self.ttl, now)
    }

    /// Reads a value from the store
    ///
    /// Returns `None` if the key was never stored or its entry has expired.
    /// An expired entry is not removed here.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();
        let fresh = self.is_fresh(self.entries.get(key)?, now);
        if !fresh {
            return None;
        }
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    /// Stores a value under `key`, replacing any previous entry
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        if let Some(max) = self.max_entries {
            if !self.entries.contains_key(&key) && self.entries.len() >= max {
                self.evict_one();
            }
        }

        let last_used = self.next_tick();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                last_used,
            },
        );
    }

    /// Removes every entry whose key contains `pattern`
    ///
    /// Matching is plain substring containment. An empty pattern matches every
    /// key. Returns the number of entries removed.
    pub fn invalidate(&mut self, pattern: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.contains(pattern));
        before - self.entries.len()
    }

    /// Removes all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet dropped
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Makes room for one entry: drops expired entries if there are any,
    /// otherwise the least recently used one
    fn evict_one(&mut self) {
        let now = Instant::now();
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| Self::fresh_at(entry, ttl, now));
        if self.entries.len() < before {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Counts entries that would currently be served as hits
    pub fn fresh_len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .values()
            .filter(|entry| self.is_fresh(entry, now))
            .count()
    }
}
