//! Observer lists with per-callback failure isolation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A list of callbacks notified in registration order.
///
/// A panicking callback is logged and skipped; the remaining callbacks
/// still run.
pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback. Dropping the returned handle keeps it registered.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).callbacks.retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Invoke every callback with `value`. Returns how many panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot so callbacks may subscribe or unsubscribe while running.
        let callbacks: Vec<Callback<T>> = lock(&self.inner)
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        let mut failed = 0;
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                failed += 1;
                tracing::error!("observer callback panicked");
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A callback never runs under this lock, so poisoning only means a
    // panic elsewhere; the registry itself is still consistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by every `on_*`/`subscribe` call.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
