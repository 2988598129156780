//! Registry of live subscriptions, at most one per key
//!
//! A registered handle is torn down when it is replaced, removed, or swept by
//! `cleanup_all`. Teardown failures (errors or panics) are logged and dropped
//! so one bad subscription cannot block the rest.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::BoxError;
use crate::key::ListenerKey;

/// Upper bound on drain rounds in `ListenerRegistry::cleanup_all`
pub const MAX_CLEANUP_PASSES: usize = 16;

/// Releases the resources held by one subscription
pub struct Teardown(Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>);

impl Teardown {
    /// Wraps a teardown that cannot report failure
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(move || {
            f();
            Ok(())
        }))
    }

    /// Wraps a teardown that may return an error
    pub fn fallible<F, E>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        Self(Box::new(move || f().map_err(Into::into)))
    }

    /// A teardown that does nothing
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Runs the teardown, logging instead of propagating any failure
    ///
    /// Returns `true` if the teardown completed without error or panic.
    pub(crate) fn run(self, key: &ListenerKey) -> bool {
        let Teardown(f) = self;
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {
                debug!(listener = %key, "Listener torn down");
                true
            }
            Ok(Err(e)) => {
                warn!(listener = %key, error = %e, "Listener teardown failed");
                false
            }
            Err(panic) => {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                warn!(listener = %key, panic = %panic_msg, "Listener teardown panicked");
                false
            }
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Teardown(..)")
    }
}

/// Tracks at most one active subscription per `ListenerKey`
///
/// All methods take `&self`; the table is guarded by a mutex that is never
/// held while a teardown runs, so a teardown may safely call back into the
/// registry.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    handles: Mutex<HashMap<ListenerKey, Teardown>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription, tearing down any existing one for `key` first
    ///
    /// The previous teardown always completes before the new handle becomes
    /// visible. If another caller registers the same key while the previous
    /// teardown runs, that registration is torn down in turn.
    pub fn add(&self, key: ListenerKey, teardown: Teardown) {
        loop {
            let previous = self.handles.lock().remove(&key);
            match previous {
                Some(previous) => {
                    debug!(listener = %key, "Replacing existing listener");
                    previous.run(&key);
                }
                None => break,
            }
        }

        let mut handles = self.handles.lock();
        if let Some(raced) = handles.insert(key.clone(), teardown) {
            drop(handles);
            raced.run(&key);
        }
        debug!(listener = %key, "Listener registered");
    }

    /// Tears down and forgets the subscription for `key`
    ///
    /// Returns `true` if a handle was registered.
    pub fn remove(&self, key: &ListenerKey) -> bool {
        let handle = self.handles.lock().remove(key);
        match handle {
            Some(teardown) => {
                teardown.run(key);
                true
            }
            None => false,
        }
    }

    /// Tears down every registered subscription and empties the registry
    ///
    /// Individual failures are logged and skipped. Listeners registered by a
    /// teardown while this runs are torn down too, up to
    /// `MAX_CLEANUP_PASSES` rounds. Returns the number of handles torn down.
    pub fn cleanup_all(&self) -> usize {
        let mut count = 0;
        let mut failed = 0;

        for _ in 0..MAX_CLEANUP_PASSES {
            let drained: Vec<(ListenerKey, Teardown)> = self.handles.lock().drain().collect();
            if drained.is_empty() {
                break;
            }
            count += drained.len();
            failed += drained
                .into_iter()
                .map(|(key, teardown)| teardown.run(&key))
                .filter(|ok| !ok)
                .count();
        }

        let left = self.len();
        if left > 0 {
            warn!(listeners = left, "Teardowns kept registering listeners, giving up");
        }
        if count > 0 {
            debug!(listeners = count, failed, "Cleaned up all listeners");
        }
        count
    }

    pub fn contains(&self, key: &ListenerKey) -> bool {
        self.handles.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}
