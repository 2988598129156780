//! Structured keys for cached queries and listener subscriptions
//!
//! A `QueryKey` pairs a resource (collection) name with a normalized parameter
//! set and serializes deterministically, so two logically identical requests
//! always land on the same cache and in-flight slot. Listener subscriptions use
//! the separate `ListenerKey` type even when they describe the same query.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a one-shot query against the remote data store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKey {
    /// Collection or resource name (e.g., "listings", "agents")
    resource: String,
    /// Query parameters, kept sorted by name
    params: BTreeMap<String, Value>,
}

impl QueryKey {
    /// Creates a key for a resource with no parameters
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter, replacing any previous value with the same name
    ///
    /// `null` values are treated as "parameter not set" and removed, so
    /// `{type: null}` and `{}` produce the same key.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        if value.is_null() {
            self.params.remove(&name);
        } else {
            self.params.insert(name, value);
        }
        self
    }

    /// Builds a key from an iterator of `(name, value)` pairs
    pub fn from_params<I, K, V>(resource: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        params
            .into_iter()
            .fold(Self::new(resource), |key, (name, value)| key.with_param(name, value))
    }

    /// Returns the resource name
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the normalized parameters
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    /// Serializes the key into its cache representation
    ///
    /// The format is `{resource}_{params}` where params is compact JSON with
    /// sorted field names, e.g. `listings_{"type":"condo"}`. Invalidation
    /// patterns match against this string, so a resource name is always a
    /// prefix of every key for that resource.
    pub fn cache_key(&self) -> String {
        let params = serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string());
        format!("{}_{}", self.resource, params)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// Identity of a long-lived subscription
///
/// Kept as its own type so a listener key can never be passed where a cache
/// key is expected, even though both are strings underneath.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerKey(String);

impl ListenerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives a listener key for a live view of the given query
    pub fn for_query(query: &QueryKey) -> Self {
        Self(format!("watch:{}", query.cache_key()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListenerKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ListenerKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}
