//! listingsync library
//!
//! Request coordination and cache layer between UI/service callers and a
//! remote listing data store: coalesced fetches, a TTL cache, and one live
//! subscription per key.

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod listeners;
pub mod store;

pub use client::{ListingClient, QueryResult};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorStats};
pub use error::{BoxError, ResolveError};
pub use key::{ListenerKey, QueryKey};
pub use listeners::Teardown;
