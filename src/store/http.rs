//! HTTP/JSON data source
//!
//! Talks to a REST-style document service:
//!
//! - `GET    {base}/{collection}?field=value` returns a JSON array of documents
//! - `PUT    {base}/{collection}/{id}` stores a document and echoes it back
//! - `DELETE {base}/{collection}/{id}` removes a document (404 if absent)
//!
//! The service has no push channel, so subscriptions poll on an interval and
//! forward a snapshot whenever the result set changes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DataSource, Document, StoreError, Subscription};
use crate::key::QueryKey;
use crate::listeners::Teardown;

/// Default interval between subscription polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Client for a remote document service
#[derive(Debug, Clone)]
pub struct HttpStore {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL of the service, without trailing slash
    base_url: String,
    /// How often subscriptions re-query the service
    poll_interval: Duration,
}

impl HttpStore {
    /// Creates a store for the service at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Creates a store with a custom HTTP client
    pub fn with_client(http_client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http_client,
            base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the subscription poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    /// Converts query params into URL query pairs
    ///
    /// Strings are sent as-is; every other JSON value is sent in its JSON form
    /// (`2`, `true`, `["a","b"]`).
    fn query_pairs(query: &QueryKey) -> Vec<(String, String)> {
        query
            .params()
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), value)
            })
            .collect()
    }

    fn check_status(status: StatusCode, url: &str) -> Result<(), StoreError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }

    async fn fetch(&self, query: &QueryKey) -> Result<Vec<Document>, StoreError> {
        let url = self.collection_url(query.resource());
        let response = self
            .http_client
            .get(&url)
            .query(&Self::query_pairs(query))
            .send()
            .await?;
        Self::check_status(response.status(), &url)?;

        let text = response.text().await?;
        let documents: Vec<Document> = serde_json::from_str(&text)?;
        Ok(documents)
    }
}

#[async_trait]
impl DataSource for HttpStore {
    async fn query(&self, query: &QueryKey) -> Result<Vec<Document>, StoreError> {
        self.fetch(query).await
    }

    async fn upsert(&self, document: Document) -> Result<Document, StoreError> {
        let url = self.document_url(&document.collection, &document.id);
        let response = self.http_client.put(&url).json(&document).send().await?;
        Self::check_status(response.status(), &url)?;

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let url = self.document_url(collection, id);
        let response = self.http_client.delete(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_status(response.status(), &url)?;
        Ok(true)
    }

    fn subscribe(
        &self,
        query: &QueryKey,
        sink: mpsc::Sender<Vec<Document>>,
    ) -> Result<Subscription, StoreError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let store = self.clone();
        let query = query.clone();
        let label = query.cache_key();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.poll_interval);
            let mut last: Option<Vec<Document>> = None;

            // Every await below races the shutdown signal, so a slow service
            // or a slow consumer cannot push a snapshot after teardown.
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {}
                }

                let fetched = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    fetched = store.fetch(&query) => fetched,
                };
                let documents = match fetched {
                    Ok(documents) => documents,
                    Err(e) => {
                        warn!(query = %query, error = %e, "Subscription poll failed");
                        continue;
                    }
                };
                if last.as_ref() == Some(&documents) {
                    continue;
                }
                last = Some(documents.clone());

                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    sent = sink.send(documents) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(query = %query, "HTTP subscription stopped");
        });

        Ok(Subscription::new(Teardown::fallible(move || {
            shutdown_tx
                .try_send(())
                .map_err(|_| StoreError::SubscriptionClosed(label))
        })))
    }
}
