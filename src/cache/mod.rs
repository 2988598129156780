//! Cache module for holding query results in memory
//!
//! This module provides a keyed store with a fixed TTL per instance. Entries
//! expire lazily: an expired entry is simply a miss. Nothing is persisted;
//! the cache lives only as long as the process.

mod store;

pub use store::CacheStore;
