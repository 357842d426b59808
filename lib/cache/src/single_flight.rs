//! Coalescing of concurrent loads for the same key.
//!
//! The first caller for a key becomes the leader and runs the work; everyone
//! arriving before the leader finishes waits for the shared outcome. The
//! outcome is broadcast exactly once, including abnormal terminations of the
//! leader (panic or task drop).

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Error produced by [`crate::LruCache::get_or_load`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// The loader returned an error. The value is not cached.
    #[error("load cache value: {0}")]
    Failed(Arc<anyhow::Error>),
    /// The loader panicked. Waiters receive the panic payload and the stack
    /// captured at the recovery point.
    #[error("cache loader panicked: {message}")]
    Panicked { message: String, backtrace: Arc<str> },
    /// The leader's task was dropped before the loader completed.
    #[error("cache loader was abandoned before completing")]
    Abandoned,
}

struct Shared<T> {
    notify: Notify,
    result: OnceLock<Result<T, LoadError>>,
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self {
            notify: Notify::new(),
            result: OnceLock::new(),
        }
    }
}

pub(crate) struct Group<K, T> {
    calls: Mutex<HashMap<K, Arc<Shared<T>>>>,
}

impl<K, T> Group<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn work<F, Fut>(&self, key: K, f: F) -> Result<T, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LoadError>>,
    {
        let (shared, is_leader) = {
            let mut calls = self.calls.lock();
            match calls.entry(key.clone()) {
                Entry::Occupied(occupied) => (occupied.get().clone(), false),
                Entry::Vacant(vacant) => {
                    let shared = Arc::new(Shared::default());
                    vacant.insert(shared.clone());
                    (shared, true)
                }
            }
        };

        if !is_leader {
            loop {
                // Arm the notification before checking to avoid a lost wakeup.
                let notified = shared.notify.notified();
                if let Some(result) = shared.result.get() {
                    return result.clone();
                }
                notified.await;
            }
        }

        let mut guard = LeaderGuard {
            group: self,
            key: Some(key),
            shared: shared.clone(),
        };
        let outcome = match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(LoadError::Panicked {
                message: panic_message(payload),
                backtrace: Backtrace::force_capture().to_string().into(),
            }),
        };
        guard.finish(outcome.clone());
        outcome
    }
}

struct LeaderGuard<'a, K: Eq + Hash + Clone, T: Clone> {
    group: &'a Group<K, T>,
    key: Option<K>,
    shared: Arc<Shared<T>>,
}

impl<K: Eq + Hash + Clone, T: Clone> LeaderGuard<'_, K, T> {
    fn finish(&mut self, result: Result<T, LoadError>) {
        self.broadcast(result);
    }

    fn broadcast(&mut self, result: Result<T, LoadError>) {
        let Some(key) = self.key.take() else {
            return;
        };
        let _ = self.shared.result.set(result);
        self.group.calls.lock().remove(&key);
        self.shared.notify.notify_waiters();
    }
}

impl<K: Eq + Hash + Clone, T: Clone> Drop for LeaderGuard<'_, K, T> {
    fn drop(&mut self) {
        // Reached with a live key only when the leader future was dropped
        // before completion.
        self.broadcast(Err(LoadError::Abandoned));
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
