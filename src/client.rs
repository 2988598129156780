//! Service-layer client used by UI code
//!
//! `ListingClient` pairs a `DataSource` with a shared `Coordinator`: reads go
//! through the coalescing cache, writes invalidate the cached queries of the
//! collection they touch, and live views are registered as listeners so a
//! view is never subscribed twice.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::coordinator::{Coordinator, CoordinatorStats};
use crate::error::ResolveError;
use crate::key::{ListenerKey, QueryKey};
use crate::store::{DataSource, Document, StoreError};

/// Cached result of one collection query
pub type QueryResult = Arc<Vec<Document>>;

/// Convenience wrapper combining a data source and a coordinator
#[derive(Clone)]
pub struct ListingClient {
    source: Arc<dyn DataSource>,
    coordinator: Arc<Coordinator<QueryResult>>,
}

impl ListingClient {
    /// Creates a client over `source` that shares `coordinator`
    pub fn new(source: Arc<dyn DataSource>, coordinator: Arc<Coordinator<QueryResult>>) -> Self {
        Self {
            source,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<QueryResult>> {
        &self.coordinator
    }

    /// Runs a query through the cache and in-flight table
    pub async fn fetch(&self, query: &QueryKey) -> Result<QueryResult, ResolveError> {
        let source = Arc::clone(&self.source);
        let owned = query.clone();
        self.coordinator
            .resolve(query, move || async move { source.query(&owned).await.map(Arc::new) })
            .await
    }

    /// Fetches a single document by id
    pub async fn fetch_by_id(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, ResolveError> {
        let query = QueryKey::new(collection).with_param("id", id);
        let documents = self.fetch(&query).await?;
        Ok(documents.first().cloned())
    }

    /// Writes a document and drops every cached query of its collection
    pub async fn save(&self, document: Document) -> Result<Document, StoreError> {
        let collection = document.collection.clone();
        let stored = self.source.upsert(document).await?;
        let removed = self.coordinator.invalidate_resource(&collection);
        debug!(collection = %collection, removed, "Invalidated after write");
        Ok(stored)
    }

    /// Deletes a document and drops every cached query of its collection
    pub async fn remove(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let deleted = self.source.delete(collection, id).await?;
        if deleted {
            self.coordinator.invalidate_resource(collection);
        }
        Ok(deleted)
    }

    /// Subscribes to live results for `query`
    ///
    /// Re-watching the same query replaces the previous subscription. Returns
    /// the listener key to pass to `unwatch`.
    pub fn watch(
        &self,
        query: &QueryKey,
        sink: mpsc::Sender<Vec<Document>>,
    ) -> Result<ListenerKey, StoreError> {
        let key = ListenerKey::for_query(query);
        let subscription = self.source.subscribe(query, sink)?;
        self.coordinator.add_listener(key.clone(), subscription.into_teardown());
        Ok(key)
    }

    pub fn unwatch(&self, key: &ListenerKey) -> bool {
        self.coordinator.remove_listener(key)
    }

    /// Releases every subscription and clears cached state, e.g. on sign-out
    pub fn sign_out(&self) {
        self.coordinator.cleanup_all();
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }
}
