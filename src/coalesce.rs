//! In-flight request coalescing.
//!
//! Concurrent requests that share a key collapse into one underlying call;
//! every caller registered while that call is in flight receives the same
//! result, in registration order, exactly once.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::{PurchasesError, Result};

type Callback<T, E> = Box<dyn FnOnce(std::result::Result<T, E>) + Send>;

/// A (success, error) callback pair waiting on one in-flight call.
pub struct CallbackPair<T, E> {
    callback: Callback<T, E>,
}

impl<T, E> CallbackPair<T, E> {
    pub fn new<S, F>(on_success: S, on_error: F) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(E) + Send + 'static,
    {
        Self {
            callback: Box::new(move |result| match result {
                Ok(value) => on_success(value),
                Err(error) => on_error(error),
            }),
        }
    }

    /// A pair backed by a single closure over the result.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(std::result::Result<T, E>) + Send + 'static,
    {
        Self {
            callback: Box::new(f),
        }
    }
}

type PendingTable<K, T, E> = Arc<Mutex<HashMap<K, Vec<CallbackPair<T, E>>>>>;

/// Collapses concurrent identical requests into one call.
pub struct Deduplicator<K, T, E> {
    pending: PendingTable<K, T, E>,
}

impl<K, T, E> Default for Deduplicator<K, T, E> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T, E> Deduplicator<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callbacks` under `key`, starting the call if none is in flight.
    ///
    /// `perform` is only invoked for the first request of a key, outside the
    /// table lock, and should eventually hand the result to the
    /// [`Completion`] it receives. A completion dropped unused frees the key
    /// and drops the waiting pairs without calling them. One that is held
    /// forever without being used keeps the key occupied.
    pub fn request<F>(&self, key: K, callbacks: CallbackPair<T, E>, perform: F)
    where
        F: FnOnce(Completion<K, T, E>),
    {
        let first = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.get_mut(&key) {
                Some(waiting) => {
                    waiting.push(callbacks);
                    false
                }
                None => {
                    pending.insert(key.clone(), vec![callbacks]);
                    true
                }
            }
        };

        if first {
            perform(Completion {
                pending: Arc::clone(&self.pending),
                key,
                done: false,
            });
        }
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<K, T> Deduplicator<K, T, PurchasesError>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
{
    /// Async form of [`Deduplicator::request`]: the first caller for `key`
    /// drives `call`, every other caller awaits its result.
    pub async fn run<F, Fut>(&self, key: K, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let (tx, rx) = oneshot::channel();
        let mut leader = None;
        self.request(
            key,
            CallbackPair::from_fn(move |result| {
                let _ = tx.send(result);
            }),
            |completion| leader = Some(completion),
        );

        // If this future is dropped mid-call, the completion's drop frees the
        // key and the waiters see their senders go away.
        if let Some(completion) = leader {
            completion.complete(call().await);
        }

        rx.await
            .map_err(|_| PurchasesError::network("coalesced request was abandoned"))?
    }
}

/// Handle that finishes one in-flight call. Consumed on use.
///
/// Dropping it unused removes the entry, so the key does not stay wedged
/// when the caller driving the call goes away.
pub struct Completion<K, T, E>
where
    K: Eq + Hash,
{
    pending: PendingTable<K, T, E>,
    key: K,
    done: bool,
}

impl<K, T, E> Completion<K, T, E>
where
    K: Eq + Hash,
{
    fn take_waiting(&mut self) -> Vec<CallbackPair<T, E>> {
        self.done = true;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key)
            .unwrap_or_default()
    }
}

impl<K, T, E> Completion<K, T, E>
where
    K: Eq + Hash,
    T: Clone,
    E: Clone,
{
    /// Remove the entry and deliver `result` to every waiting pair.
    pub fn complete(mut self, result: std::result::Result<T, E>) {
        for pair in self.take_waiting() {
            (pair.callback)(result.clone());
        }
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: E) {
        self.complete(Err(error));
    }
}

impl<K, T, E> Drop for Completion<K, T, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let abandoned = self.take_waiting();
        tracing::debug!(waiting = abandoned.len(), "in-flight call abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_second_request_joins_first() {
        let dedup: Deduplicator<String, u32, String> = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut completion = None;

        for i in 0..2 {
            let results = Arc::clone(&results);
            let calls = Arc::clone(&calls);
            dedup.request(
                "k".to_string(),
                CallbackPair::new(
                    move |v| results.lock().unwrap().push((i, v)),
                    |_e: String| panic!("unexpected error"),
                ),
                |c| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    completion = Some(c);
                },
            );
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 1);

        completion.unwrap().succeed(7);
        assert_eq!(*results.lock().unwrap(), vec![(0, 7), (1, 7)]);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[test]
    fn test_dropped_completion_frees_key() {
        let dedup: Deduplicator<&'static str, u32, String> = Deduplicator::new();
        let called = Arc::new(AtomicUsize::new(0));
        let mut completion = None;

        for _ in 0..2 {
            let called = Arc::clone(&called);
            dedup.request(
                "k",
                CallbackPair::from_fn(move |_| {
                    called.fetch_add(1, Ordering::SeqCst);
                }),
                |c| completion = Some(c),
            );
        }
        assert_eq!(dedup.in_flight(), 1);

        drop(completion.take());
        assert_eq!(dedup.in_flight(), 0);
        assert_eq!(called.load(Ordering::SeqCst), 0);

        let mut performed = false;
        dedup.request("k", CallbackPair::from_fn(|_| {}), |c| {
            performed = true;
            c.succeed(1);
        });
        assert!(performed);
    }

    #[test]
    fn test_key_is_reusable_after_completion() {
        let dedup: Deduplicator<&'static str, u32, String> = Deduplicator::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            dedup.request("k", CallbackPair::from_fn(|_| {}), |c| {
                calls.fetch_add(1, Ordering::SeqCst);
                c.fail("boom".to_string());
            });
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
