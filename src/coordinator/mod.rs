//! Coordinator facade over the cache, in-flight table and listener registry
//!
//! A `Coordinator` is built once per session and handed to every consumer as
//! an `Arc`. One-shot reads go through `resolve`, which consults the cache,
//! then joins or starts a coalesced fetch. Subscriptions go straight to the
//! listener registry. `cleanup_all` is the session teardown: it releases every
//! subscription and clears cached and in-flight state.

mod inflight;

pub use inflight::{CoordinatorStats, RequestCoordinator};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::CacheStore;
use crate::config::CoordinatorConfig;
use crate::error::{BoxError, ResolveError};
use crate::key::{ListenerKey, QueryKey};
use crate::listeners::{ListenerRegistry, Teardown};

/// Request coordination and cache layer for values of type `V`
pub struct Coordinator<V> {
    requests: RequestCoordinator<V>,
    listeners: ListenerRegistry,
}

impl<V> Coordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a coordinator from configuration
    pub fn new(config: &CoordinatorConfig) -> Self {
        let mut cache = CacheStore::new(config.ttl());
        if let Some(max) = config.max_entries {
            cache = cache.with_max_entries(max);
        }
        Self {
            requests: RequestCoordinator::new(cache),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Creates a coordinator with default settings wrapped for sharing
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new(&CoordinatorConfig::default()))
    }

    /// Resolves a query, fetching only when neither the cache nor an
    /// in-flight request can answer it
    ///
    /// See `RequestCoordinator::resolve` for the exact semantics.
    pub async fn resolve<F, Fut, E>(&self, key: &QueryKey, fetch: F) -> Result<V, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.requests.resolve(&key.cache_key(), fetch).await
    }

    /// Like `resolve`, for callers that already hold a serialized cache key
    pub async fn resolve_raw<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.requests.resolve(key, fetch).await
    }

    /// Drops cached results whose key contains `pattern`
    ///
    /// An empty or very short pattern may match unrelated resources; narrowing
    /// it is up to the caller.
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.requests.invalidate(pattern)
    }

    /// Drops every cached result for a resource
    ///
    /// Matches on `{resource}_{` so that `listings` does not also hit a
    /// `listings_agents` resource.
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        self.requests.invalidate(&format!("{resource}_{{"))
    }

    /// Registers a subscription teardown, replacing any existing one for `key`
    pub fn add_listener(&self, key: ListenerKey, teardown: Teardown) {
        self.listeners.add(key, teardown);
    }

    /// Tears down the subscription for `key`, if any
    pub fn remove_listener(&self, key: &ListenerKey) -> bool {
        self.listeners.remove(key)
    }

    pub fn has_listener(&self, key: &ListenerKey) -> bool {
        self.listeners.contains(key)
    }

    /// Session teardown: releases all subscriptions, then clears the cache and
    /// in-flight table
    pub fn cleanup_all(&self) {
        let listeners = self.listeners.cleanup_all();
        self.requests.clear();
        info!(listeners, "Coordinator state cleaned up");
    }

    pub fn ttl(&self) -> Duration {
        self.requests.ttl()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            listeners: self.listeners.len(),
            ..self.requests.stats()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("permission denied")]
    struct Denied;

    fn counting_teardown(counter: &Arc<AtomicUsize>) -> Teardown {
        let counter = Arc::clone(counter);
        Teardown::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_resolve_with_query_key() {
        let coordinator: Arc<Coordinator<Vec<u32>>> = Coordinator::shared();
        let key = QueryKey::new("listings").with_param("type", "condo");

        let value = coordinator
            .resolve(&key, || async { Ok::<_, Denied>(vec![1, 2]) })
            .await
            .expect("Fetch should succeed");
        assert_eq!(value, vec![1, 2]);

        let raw = coordinator
            .resolve_raw(r#"listings_{"type":"condo"}"#, || async { Ok::<_, Denied>(vec![9]) })
            .await
            .expect("Cache hit should succeed");
        assert_eq!(raw, vec![1, 2], "Raw key should hit the same entry");
    }

    #[tokio::test]
    async fn test_invalidate_resource_leaves_other_resources() {
        let coordinator: Arc<Coordinator<u32>> = Coordinator::shared();
        let listings = QueryKey::new("listings");
        let listing_agents = QueryKey::new("listings_agents");
        let agents = QueryKey::new("agents");
        for key in [&listings, &listing_agents, &agents] {
            coordinator
                .resolve(key, || async { Ok::<_, Denied>(1) })
                .await
                .expect("Fetch should succeed");
        }

        assert_eq!(coordinator.invalidate_resource("listings"), 1);
        assert_eq!(coordinator.stats().cached_entries, 2);
    }

    #[tokio::test]
    async fn test_cleanup_all_releases_everything() {
        let coordinator: Arc<Coordinator<u32>> = Coordinator::shared();
        let torn_down = Arc::new(AtomicUsize::new(0));

        coordinator.add_listener(ListenerKey::new("listings"), counting_teardown(&torn_down));
        coordinator.add_listener(ListenerKey::new("agents"), counting_teardown(&torn_down));
        coordinator
            .resolve(&QueryKey::new("offers"), || async { Ok::<_, Denied>(7) })
            .await
            .expect("Fetch should succeed");
        assert_eq!(coordinator.stats().listeners, 2);

        coordinator.cleanup_all();

        assert_eq!(torn_down.load(Ordering::SeqCst), 2);
        let stats = coordinator.stats();
        assert_eq!(stats.listeners, 0);
        assert_eq!(stats.cached_entries, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_listener_and_cache_key_spaces_are_separate() {
        let coordinator: Arc<Coordinator<u32>> = Coordinator::shared();
        let torn_down = Arc::new(AtomicUsize::new(0));
        coordinator.add_listener(ListenerKey::new("listings_{}"), counting_teardown(&torn_down));
        coordinator
            .resolve(&QueryKey::new("listings"), || async { Ok::<_, Denied>(1) })
            .await
            .expect("Fetch should succeed");

        coordinator.invalidate("listings");

        assert!(coordinator.has_listener(&ListenerKey::new("listings_{}")));
        assert_eq!(torn_down.load(Ordering::SeqCst), 0);
        assert!(coordinator.remove_listener(&ListenerKey::new("listings_{}")));
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_config_applies_to_cache() {
        let config = CoordinatorConfig::new().with_max_entries(1);
        let coordinator: Coordinator<u32> = Coordinator::new(&config);
        coordinator
            .resolve(&QueryKey::new("listings"), || async { Ok::<_, Denied>(1) })
            .await
            .expect("Fetch should succeed");
        coordinator
            .resolve(&QueryKey::new("agents"), || async { Ok::<_, Denied>(2) })
            .await
            .expect("Fetch should succeed");

        assert_eq!(coordinator.stats().cached_entries, 1);
        assert_eq!(coordinator.ttl(), Duration::from_secs(300));
    }
}
