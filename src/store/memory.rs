//! In-process data source
//!
//! `MemoryStore` keeps collections in memory and notifies subscribers through
//! a broadcast channel whenever a collection changes. It backs the demo binary
//! and the integration tests, and can simulate network latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use super::{DataSource, Document, StoreError, Subscription};
use crate::key::QueryKey;
use crate::listeners::Teardown;

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 64;

type Collections = HashMap<String, BTreeMap<String, Document>>;

/// In-memory collections with change notifications
#[derive(Debug, Clone)]
pub struct MemoryStore {
    collections: Arc<RwLock<Collections>>,
    changes: broadcast::Sender<String>,
    latency: Duration,
    queries: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store with no simulated latency
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            changes,
            latency: Duration::ZERO,
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delays every query by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Creates a store pre-filled with a handful of listings and agents
    pub fn with_sample_data() -> Self {
        let store = Self::new();
        let listings = [
            ("l-100", json!({"type": "condo", "city": "Vancouver", "beds": 2, "price": 749000, "agent": "a-1"})),
            ("l-101", json!({"type": "house", "city": "Burnaby", "beds": 4, "price": 1650000, "agent": "a-2"})),
            ("l-102", json!({"type": "condo", "city": "Richmond", "beds": 1, "price": 529000, "agent": "a-1"})),
            ("l-103", json!({"type": "townhouse", "city": "Vancouver", "beds": 3, "price": 1189000, "agent": "a-3"})),
        ];
        let agents = [
            ("a-1", json!({"name": "Priya Natarajan", "office": "downtown"})),
            ("a-2", json!({"name": "Marco Ruiz", "office": "metrotown"})),
            ("a-3", json!({"name": "Jun Park", "office": "downtown"})),
        ];

        {
            let mut collections = store.collections.write();
            for (collection, rows) in [("listings", &listings[..]), ("agents", &agents[..])] {
                let docs = collections.entry(collection.to_string()).or_default();
                for (id, data) in rows {
                    let data = data.as_object().cloned().unwrap_or_default();
                    docs.insert(id.to_string(), Document::new(collection, *id, data));
                }
            }
        }
        store
    }

    /// Number of `query` calls served so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn snapshot(&self, query: &QueryKey) -> Vec<Document> {
        self.collections
            .read()
            .get(query.resource())
            .map(|docs| docs.values().filter(|doc| doc.matches(query)).cloned().collect())
            .unwrap_or_default()
    }

    fn notify(&self, collection: &str) {
        // No receivers just means nobody is subscribed
        let _ = self.changes.send(collection.to_string());
    }
}

#[async_trait]
impl DataSource for MemoryStore {
    async fn query(&self, query: &QueryKey) -> Result<Vec<Document>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.snapshot(query))
    }

    async fn upsert(&self, mut document: Document) -> Result<Document, StoreError> {
        document.updated_at = Utc::now();
        let collection = document.collection.clone();
        self.collections
            .write()
            .entry(collection.clone())
            .or_default()
            .insert(document.id.clone(), document.clone());
        self.notify(&collection);
        Ok(document)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .collections
            .write()
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        if removed {
            self.notify(collection);
        }
        Ok(removed)
    }

    fn subscribe(
        &self,
        query: &QueryKey,
        sink: mpsc::Sender<Vec<Document>>,
    ) -> Result<Subscription, StoreError> {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut changes = self.changes.subscribe();
        let store = self.clone();
        let query = query.clone();
        let label = query.cache_key();

        tokio::spawn(async move {
            let mut pending = Some(store.snapshot(&query));

            // Both the push and the wait for changes race the shutdown signal,
            // so nothing is delivered once the teardown has returned.
            loop {
                if let Some(documents) = pending.take() {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => break,
                        sent = sink.send(documents) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }

                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    changed = changes.recv() => {
                        match changed {
                            Ok(collection) if collection != query.resource() => {}
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                pending = Some(store.snapshot(&query));
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!(query = %query, "Memory subscription stopped");
        });

        Ok(Subscription::new(Teardown::fallible(move || {
            shutdown_tx
                .send(())
                .map_err(|_| StoreError::SubscriptionClosed(label))
        })))
    }
}
