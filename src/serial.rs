//! Strict one-at-a-time execution.
//!
//! Some store APIs reject a call while another one from the same API is
//! still outstanding. [`SerialExecutor`] runs queued operations in FIFO
//! order and starts the next one only after the current one calls
//! [`Finish::finish`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

type Operation = Box<dyn FnOnce(Finish) + Send>;

#[derive(Default)]
struct State {
    queue: VecDeque<Operation>,
    active: bool,
}

/// FIFO executor with at most one operation in flight.
#[derive(Clone, Default)]
pub struct SerialExecutor {
    state: Arc<Mutex<State>>,
}

impl SerialExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `op`. It runs immediately if nothing is active, otherwise after
    /// every earlier operation has finished.
    ///
    /// `op` must call [`Finish::finish`] exactly once; until it does, the
    /// executor stays occupied. Extra calls are ignored.
    pub fn execute_serially<F>(&self, op: F)
    where
        F: FnOnce(Finish) + Send + 'static,
    {
        let next = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.queue.push_back(Box::new(op));
            if state.active {
                None
            } else {
                state.active = true;
                state.queue.pop_front()
            }
        };

        if let Some(op) = next {
            self.run(op);
        }
    }

    /// Run `f` once every earlier operation has finished, finishing when the
    /// returned future completes or is dropped.
    pub async fn run_serially<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (tx, rx) = oneshot::channel();
        self.execute_serially(move |finish| {
            if let Err(finish) = tx.send(finish) {
                // Caller went away before its turn.
                finish.finish();
            }
        });

        // The sender is only dropped after it has been used, so this only
        // fails if the executor itself is gone.
        let _guard = rx.await.ok().map(FinishGuard);
        f().await
    }

    /// Whether an operation is currently running.
    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }

    /// Operations waiting behind the active one.
    pub fn queued(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    fn run(&self, op: Operation) {
        let finish = Finish {
            executor: self.clone(),
            fired: Arc::new(AtomicBool::new(false)),
        };
        op(finish);
    }

    fn advance(&self) {
        let next = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.queue.pop_front() {
                Some(op) => Some(op),
                None => {
                    state.active = false;
                    None
                }
            }
        };

        if let Some(op) = next {
            self.run(op);
        }
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("active", &self.is_active())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Completion handle given to each operation. Clones share one flag, so
/// only the first call to `finish` across all clones has an effect.
#[derive(Clone)]
pub struct Finish {
    executor: SerialExecutor,
    fired: Arc<AtomicBool>,
}

impl Finish {
    pub fn finish(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.executor.advance();
    }
}

struct FinishGuard(Finish);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}
