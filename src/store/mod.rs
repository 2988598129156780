//! Remote data store seam
//!
//! The coordinator never builds queries itself; it is handed fetch futures and
//! subscription teardowns by code talking to a `DataSource`. This module
//! defines that trait, the document shape it returns, and two sources: an
//! in-process `MemoryStore` and an HTTP/JSON `HttpStore`.

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::key::QueryKey;
use crate::listeners::Teardown;

/// Errors that can occur when talking to a data source
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    /// Failed to parse JSON response
    #[error("Failed to parse JSON response: {0}")]
    ParseError(#[from] serde_json::Error),

    /// The subscription task has already stopped
    #[error("Subscription for '{0}' is already closed")]
    SubscriptionClosed(String),
}

/// A record stored in one collection of the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Identifier, unique within the collection
    pub id: String,
    /// Collection the document belongs to (e.g., "listings")
    pub collection: String,
    /// Document fields
    #[serde(default)]
    pub data: Map<String, Value>,
    /// When the document was last written
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Creates a document stamped with the current time
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            data,
            updated_at: Utc::now(),
        }
    }

    /// Returns a field value
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Whether the document satisfies every parameter of `query`
    ///
    /// Parameters are equality filters on data fields; the `id` parameter
    /// matches the document id.
    pub fn matches(&self, query: &QueryKey) -> bool {
        self.collection == query.resource()
            && query.params().iter().all(|(name, expected)| {
                if name == "id" {
                    expected.as_str() == Some(self.id.as_str())
                } else {
                    self.data.get(name) == Some(expected)
                }
            })
    }
}

/// A live subscription established with a data source
///
/// Hand it to the coordinator with `into_teardown` so it is released on
/// replacement, removal, or sign-out.
#[derive(Debug)]
pub struct Subscription {
    teardown: Teardown,
}

impl Subscription {
    pub fn new(teardown: Teardown) -> Self {
        Self { teardown }
    }

    pub fn into_teardown(self) -> Teardown {
        self.teardown
    }
}

/// Query, write and subscription primitives of the remote store
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Returns every document of `query.resource()` matching its parameters
    async fn query(&self, query: &QueryKey) -> Result<Vec<Document>, StoreError>;

    /// Creates or replaces a document, returning the stored version
    async fn upsert(&self, document: Document) -> Result<Document, StoreError>;

    /// Deletes a document; returns `false` if it did not exist
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Starts pushing result snapshots for `query` into `sink`
    ///
    /// Must be called from within a tokio runtime. The returned subscription's
    /// teardown stops the push task.
    fn subscribe(
        &self,
        query: &QueryKey,
        sink: mpsc::Sender<Vec<Document>>,
    ) -> Result<Subscription, StoreError>;
}
