//! Lifecycle management for long-lived subscriptions
//!
//! Subscriptions bypass the cache and coalescing path entirely; they are
//! tracked here so each key has at most one live subscription and every one
//! of them is released on replacement, removal, or session teardown.

mod registry;

pub use registry::{ListenerRegistry, Teardown};
