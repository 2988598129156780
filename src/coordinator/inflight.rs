//! Request coalescing on top of the cache store
//!
//! `RequestCoordinator` guarantees that at most one fetch runs per key at a
//! time. The first caller on a cold key spawns the fetch and publishes a shared
//! handle to it; every caller arriving before it settles awaits that same
//! handle and sees the same value or the same `Arc`-shared error.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::CacheStore;
use crate::error::{BoxError, ResolveError};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, ResolveError>>>;
type ResultSender<V> = oneshot::Sender<Result<V, ResolveError>>;

/// The single outstanding fetch for a key
struct InFlightRequest<V> {
    /// Distinguishes this fetch from later ones registered under the same key
    id: u64,
    pending: SharedFetch<V>,
}

/// What a caller does after inspecting the tables
enum Claim<V> {
    /// Await a fetch another caller started
    Join(SharedFetch<V>),
    /// Start the fetch for a slot registered under `id`
    Lead {
        id: u64,
        sender: ResultSender<V>,
        pending: SharedFetch<V>,
    },
}

/// Snapshot of coordinator activity counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Resolves answered from the cache
    pub cache_hits: u64,
    /// Resolves that started a new fetch
    pub fetches_started: u64,
    /// Resolves that joined a fetch already in flight
    pub joined: u64,
    /// Fetches that settled with an error
    pub fetch_failures: u64,
    /// Entries currently held by the cache (fresh or expired)
    pub cached_entries: usize,
    /// Cached entries that would still be served as hits
    pub fresh_entries: usize,
    /// Fetches currently in flight
    pub in_flight: usize,
    /// Registered listeners
    pub listeners: usize,
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    fetches_started: AtomicU64,
    joined: AtomicU64,
    fetch_failures: AtomicU64,
}

/// State shared between the coordinator and its spawned fetch tasks
///
/// Lock order is always `in_flight` then `cache`.
struct Inner<V> {
    cache: Mutex<CacheStore<V>>,
    in_flight: Mutex<HashMap<String, InFlightRequest<V>>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl<V: Clone> Inner<V> {
    /// Called by the fetch task once the fetch has settled
    ///
    /// Removes the in-flight entry if it is still the one this task created,
    /// and only in that case caches a successful result. An entry that was
    /// cleared in the meantime means the caller asked for a clean slate.
    fn settle(&self, key: &str, id: u64, result: &Result<V, ResolveError>) {
        let mut in_flight = self.in_flight.lock();
        let owned = in_flight.get(key).is_some_and(|entry| entry.id == id);
        if !owned {
            debug!(key, "In-flight entry superseded, result not cached");
            return;
        }
        in_flight.remove(key);

        match result {
            Ok(value) => self.cache.lock().set(key, value.clone()),
            Err(e) => {
                self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                debug!(key, error = %e, "Fetch failed, cache left untouched");
            }
        }
    }
}

/// Deduplicates concurrent fetches per key and fills the cache on success
///
/// The cache check, in-flight check and in-flight registration happen under a
/// single lock with no await point in between; this is what keeps two callers
/// from both starting a fetch for the same key on a multi-threaded runtime.
pub struct RequestCoordinator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> RequestCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a coordinator that owns the given cache store
    pub fn new(cache: CacheStore<V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(cache),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Resolves `key`, invoking `fetch` only on a cache miss with nothing in flight
    ///
    /// The in-flight slot is claimed under the lock, then `fetch` is called
    /// with the lock released, so it may call back into the coordinator. The
    /// future it returns is spawned onto the tokio runtime and runs to
    /// completion even if every caller stops waiting. Must be called from
    /// within a tokio runtime.
    ///
    /// # Returns
    /// * `Ok(V)` from the cache or from the (possibly shared) fetch
    /// * `Err(ResolveError::Fetch)` with the fetch error, shared by all joiners
    /// * `Err(ResolveError::Aborted)` if the fetch panicked
    pub async fn resolve<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let claim = {
            let mut in_flight = self.inner.in_flight.lock();

            let cached = self.inner.cache.lock().get(key);
            if let Some(value) = cached {
                self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }

            let existing = in_flight.get(key).map(|entry| entry.pending.clone());
            match existing {
                Some(pending) => {
                    self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "Joining in-flight fetch");
                    Claim::Join(pending)
                }
                None => {
                    self.inner.counters.fetches_started.fetch_add(1, Ordering::Relaxed);
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (sender, receiver) = oneshot::channel();
                    let pending = Self::receive(key, receiver);
                    in_flight.insert(
                        key.to_string(),
                        InFlightRequest {
                            id,
                            pending: pending.clone(),
                        },
                    );
                    debug!(key, "Started fetch");
                    Claim::Lead { id, sender, pending }
                }
            }
        };

        let pending = match claim {
            Claim::Join(pending) => pending,
            Claim::Lead { id, sender, pending } => {
                match std::panic::catch_unwind(AssertUnwindSafe(fetch)) {
                    Ok(fut) => self.spawn_fetch(key.to_string(), id, fut, sender),
                    Err(_) => {
                        let result = Err(ResolveError::Aborted(format!("fetch for '{key}' panicked")));
                        self.inner.settle(key, id, &result);
                        let _ = sender.send(result);
                    }
                }
                pending
            }
        };

        pending.await
    }

    /// Shared handle that every caller of one fetch awaits
    fn receive(key: &str, receiver: oneshot::Receiver<Result<V, ResolveError>>) -> SharedFetch<V> {
        let key = key.to_string();
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(ResolveError::Aborted(format!("fetch for '{key}' was dropped"))))
        }
        .boxed()
        .shared()
    }

    fn spawn_fetch<Fut, E>(&self, key: String, id: u64, fut: Fut, sender: ResultSender<V>)
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(ResolveError::fetch(e)),
                Err(_) => Err(ResolveError::Aborted(format!("fetch for '{key}' panicked"))),
            };
            inner.settle(&key, id, &result);
            // Nobody waiting is fine, the result is already cached
            let _ = sender.send(result);
        });
    }

    /// Removes cached entries whose key contains `pattern`
    ///
    /// Fetches already in flight are not affected and will still cache their
    /// result when they settle.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let removed = self.inner.cache.lock().invalidate(pattern);
        debug!(pattern, removed, "Invalidated cache entries");
        removed
    }

    /// Drops every cached entry and forgets all in-flight fetches
    ///
    /// Callers already awaiting a fetch still receive its result, but that
    /// result is not written to the cache.
    pub fn clear(&self) {
        let mut in_flight = self.inner.in_flight.lock();
        in_flight.clear();
        self.inner.cache.lock().clear();
    }

    /// Whether a fetch for `key` is currently in flight
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    pub fn ttl(&self) -> Duration {
        self.inner.cache.lock().ttl()
    }

    /// Returns counters plus current table sizes (listeners left at zero)
    pub fn stats(&self) -> CoordinatorStats {
        let in_flight = self.inner.in_flight.lock().len();
        let (cached_entries, fresh_entries) = {
            let cache = self.inner.cache.lock();
            (cache.len(), cache.fresh_len())
        };
        let counters = &self.inner.counters;
        CoordinatorStats {
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            fetches_started: counters.fetches_started.load(Ordering::Relaxed),
            joined: counters.joined.load(Ordering::Relaxed),
            fetch_failures: counters.fetch_failures.load(Ordering::Relaxed),
            cached_entries,
            fresh_entries,
            in_flight,
            listeners: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use thiserror::Error;

    const TTL: Duration = Duration::from_secs(300);

    #[derive(Debug, Error)]
    #[error("remote store timed out")]
    struct Timeout;

    fn coordinator() -> Arc<RequestCoordinator<String>> {
        Arc::new(RequestCoordinator::new(CacheStore::new(TTL)))
    }

    #[tokio::test]
    async fn test_miss_invokes_fetch_and_caches() {
        let coordinator = coordinator();

        let value = coordinator
            .resolve("listings_{}", || async { Ok::<_, Timeout>("three listings".to_string()) })
            .await
            .expect("Fetch should succeed");

        assert_eq!(value, "three listings");
        assert!(!coordinator.is_in_flight("listings_{}"));
        assert_eq!(coordinator.stats().cached_entries, 1);
        assert_eq!(coordinator.stats().fetches_started, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let calls = Arc::clone(&calls);
            coordinator
                .resolve("listings_{}", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release_rx.await.ok();
                    Ok::<_, Timeout>("shared".to_string())
                })
                .boxed()
        };

        let mut joiners = Vec::new();
        for _ in 0..4 {
            let calls = Arc::clone(&calls);
            joiners.push(
                coordinator
                    .resolve("listings_{}", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Timeout>("duplicate".to_string())
                    })
                    .boxed(),
            );
        }

        let all = futures::future::join_all(std::iter::once(first).chain(joiners));
        tokio::pin!(all);

        // Let every caller register before the fetch is released
        tokio::select! {
            _ = &mut all => panic!("Fetch completed before release"),
            _ = tokio::task::yield_now() => {}
        }
        assert!(coordinator.is_in_flight("listings_{}"));
        release_tx.send(()).expect("Fetch task should be waiting");

        let results = all.await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.expect("All callers should succeed"), "shared");
        }
        let stats = coordinator.stats();
        assert_eq!(stats.fetches_started, 1);
        assert_eq!(stats.joined, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_tasks_share_one_fetch() {
        const CALLERS: usize = 64;
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let calls = Arc::clone(&calls);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    coordinator
                        .resolve("agents_{}", move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, Timeout>("three agents".to_string())
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            let value = handle.await.expect("Task should not panic");
            assert_eq!(value.expect("Resolve should succeed"), "three agents");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = coordinator.stats();
        assert_eq!(stats.fetches_started, 1);
        assert_eq!(stats.joined + stats.cache_hits, (CALLERS - 1) as u64);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_fetch_closure_may_call_back_into_coordinator() {
        let coordinator = coordinator();
        let observer = Arc::clone(&coordinator);

        let value = coordinator
            .resolve("listings_{}", move || {
                let stats = observer.stats();
                let registered = observer.is_in_flight("listings_{}");
                observer.invalidate("agents");
                async move { Ok::<_, Timeout>(format!("{}:{registered}", stats.in_flight)) }
            })
            .await
            .expect("Fetch should succeed");

        assert_eq!(value, "1:true");
        assert_eq!(coordinator.stats().cached_entries, 1);
    }

    #[tokio::test]
    async fn test_panic_while_building_fetch_releases_slot() {
        let coordinator = coordinator();

        let result = coordinator
            .resolve("listings_{}", || -> futures::future::Ready<Result<String, Timeout>> {
                panic!("bad query builder")
            })
            .await;
        assert!(matches!(result, Err(ResolveError::Aborted(_))));
        assert!(!coordinator.is_in_flight("listings_{}"));

        let value = coordinator
            .resolve("listings_{}", || async { Ok::<_, Timeout>("retried".to_string()) })
            .await
            .expect("Slot should be free again");
        assert_eq!(value, "retried");
    }

    #[tokio::test]
    async fn test_joined_callers_receive_identical_failure() {
        let coordinator = coordinator();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = coordinator.resolve("agents_{}", move || async move {
            release_rx.await.ok();
            Err::<String, _>(Timeout)
        });
        tokio::pin!(first);
        tokio::select! {
            biased;
            _ = &mut first => panic!("Fetch completed before release"),
            _ = tokio::task::yield_now() => {}
        }

        let second = coordinator.resolve("agents_{}", || async { Ok::<_, Timeout>("unused".to_string()) });
        release_tx.send(()).expect("Fetch task should be waiting");

        let (a, b) = tokio::join!(first, second);

        let a = a.unwrap_err();
        let b = b.unwrap_err();
        assert!(a.same_failure(&b), "Joiners must see the same failure");
        assert!(a.downcast_ref::<Timeout>().is_some());
        assert_eq!(coordinator.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_cache() {
        let coordinator = coordinator();

        let failed = coordinator
            .resolve("listings_{}", || async { Err::<String, _>(Timeout) })
            .await;
        assert!(failed.is_err());
        assert!(!coordinator.is_in_flight("listings_{}"));
        assert_eq!(coordinator.stats().cached_entries, 0);

        let calls = Arc::new(AtomicUsize::new(0));
        let retry_calls = Arc::clone(&calls);
        let value = coordinator
            .resolve("listings_{}", move || async move {
                retry_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Timeout>("recovered".to_string())
            })
            .await
            .expect("Retry should succeed");

        assert_eq!(value, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let coordinator = coordinator();
        coordinator
            .resolve("agents_{}", || async { Ok::<_, Timeout>("first".to_string()) })
            .await
            .expect("Fetch should succeed");

        let calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::clone(&calls);
        let value = coordinator
            .resolve("agents_{}", move || {
                second_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Timeout>("second".to_string()) }
            })
            .await
            .expect("Cache hit should succeed");

        assert_eq!(value, "first");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.stats().cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_triggers_new_fetch() {
        let coordinator = coordinator();
        coordinator
            .resolve("agents_{}", || async { Ok::<_, Timeout>("stale".to_string()) })
            .await
            .expect("Fetch should succeed");

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let stats = coordinator.stats();
        assert_eq!((stats.cached_entries, stats.fresh_entries), (1, 0));

        let value = coordinator
            .resolve("agents_{}", || async { Ok::<_, Timeout>("fresh".to_string()) })
            .await
            .expect("Refetch should succeed");
        assert_eq!(value, "fresh");
        assert_eq!(coordinator.stats().fetches_started, 2);
        assert_eq!(coordinator.stats().fresh_entries, 1);
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_reported_and_cleared() {
        let coordinator = coordinator();

        let result = coordinator
            .resolve("listings_{}", || async {
                if true {
                    panic!("driver bug");
                }
                Ok::<_, Timeout>(String::new())
            })
            .await;

        assert!(matches!(result, Err(ResolveError::Aborted(_))));
        assert!(!coordinator.is_in_flight("listings_{}"));
    }

    #[tokio::test]
    async fn test_fetch_runs_to_completion_after_caller_drops() {
        let coordinator = coordinator();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        {
            let abandoned = coordinator.resolve("listings_{}", move || async move {
                release_rx.await.ok();
                done_tx.send(()).ok();
                Ok::<_, Timeout>("late".to_string())
            });
            tokio::pin!(abandoned);
            tokio::select! {
                _ = &mut abandoned => panic!("Fetch should still be waiting"),
                _ = tokio::task::yield_now() => {}
            }
        }

        release_tx.send(()).expect("Fetch task should be alive");
        done_rx.await.expect("Fetch should finish without callers");
        tokio::task::yield_now().await;

        let value = coordinator
            .resolve("listings_{}", || async { Ok::<_, Timeout>("refetched".to_string()) })
            .await
            .expect("Resolve should succeed");
        assert_eq!(value, "late");
    }

    #[tokio::test]
    async fn test_clear_prevents_late_result_from_being_cached() {
        let coordinator = coordinator();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let pending = coordinator.resolve("listings_{}", move || async move {
            release_rx.await.ok();
            Ok::<_, Timeout>("before sign-out".to_string())
        });
        let (value, _) = tokio::join!(pending, async {
            tokio::task::yield_now().await;
            coordinator.clear();
            release_tx.send(()).ok();
        });

        assert_eq!(value.expect("Waiting caller still gets the result"), "before sign-out");
        assert_eq!(coordinator.stats().cached_entries, 0);
        assert_eq!(coordinator.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let coordinator = coordinator();
        for key in ["listings_{}", r#"listings_{"type":"condo"}"#, "agents_{}"] {
            coordinator
                .resolve(key, || async { Ok::<_, Timeout>("v1".to_string()) })
                .await
                .expect("Fetch should succeed");
        }

        assert_eq!(coordinator.invalidate("listings"), 2);

        let agents = coordinator
            .resolve("agents_{}", || async { Ok::<_, Timeout>("v2".to_string()) })
            .await
            .expect("Resolve should succeed");
        let listings = coordinator
            .resolve("listings_{}", || async { Ok::<_, Timeout>("v2".to_string()) })
            .await
            .expect("Resolve should succeed");
        assert_eq!(agents, "v1");
        assert_eq!(listings, "v2");
    }
}
