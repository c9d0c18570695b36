//! Completion queue drained by the worker threads.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::Completion;

/// Multi-producer, multi-consumer queue of finished operations.
///
/// Every completion is handed to exactly one caller of [`pop`](Self::pop).
#[derive(Debug, Default)]
pub struct CompletionQueue {
    entries: Mutex<VecDeque<Completion>>,
    available: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a completion and wakes one waiter.
    pub fn push(&self, completion: Completion) {
        self.lock().push_back(completion);
        self.available.notify_one();
    }

    /// Removes the oldest completion, waiting up to `timeout` for one.
    ///
    /// `None` waits indefinitely. Returns `None` only when the timeout expired.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<Completion> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut entries = self.lock();

        loop {
            if let Some(completion) = entries.pop_front() {
                return Some(completion);
            }

            match deadline {
                None => {
                    entries = self
                        .available
                        .wait(entries)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    entries = self
                        .available
                        .wait_timeout(entries, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Removes every queued completion without waiting.
    pub fn drain(&self) -> Vec<Completion> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Completion>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
