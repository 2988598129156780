//! Error types shared across the coordinator
//!
//! Fetch failures are wrapped in an `Arc` so a single failure can be handed to
//! every caller that joined the same in-flight request.

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error accepted from fetch operations and listener teardowns
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors returned from `Coordinator::resolve`
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The fetch operation returned an error
    ///
    /// Every caller joined on the same key receives a clone of the same `Arc`.
    #[error("Fetch failed: {0}")]
    Fetch(Arc<dyn StdError + Send + Sync + 'static>),

    /// The fetch task panicked or was aborted before settling
    #[error("Fetch task aborted: {0}")]
    Aborted(String),
}

impl ResolveError {
    pub(crate) fn fetch(err: impl Into<BoxError>) -> Self {
        ResolveError::Fetch(Arc::from(err.into()))
    }

    /// Returns the underlying fetch error, if this is a fetch failure
    pub fn fetch_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            ResolveError::Fetch(err) => Some(err.as_ref()),
            ResolveError::Aborted(_) => None,
        }
    }

    /// Attempts to view the fetch error as a concrete type
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.fetch_error().and_then(|err| err.downcast_ref::<E>())
    }

    /// Whether two errors are the very same shared failure
    pub fn same_failure(&self, other: &ResolveError) -> bool {
        match (self, other) {
            (ResolveError::Fetch(a), ResolveError::Fetch(b)) => Arc::ptr_eq(a, b),
            (ResolveError::Aborted(a), ResolveError::Aborted(b)) => a == b,
            _ => false,
        }
    }
}
