//! Shared free list of operation contexts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::operation::OperationContext;

/// LIFO pool of [`OperationContext`]s shared by every connection of an engine.
///
/// A context is owned by exactly one holder at a time: either the pool or the
/// operation it is in flight for. The pool never blocks beyond its mutex and
/// never fails; when it runs dry it allocates.
#[derive(Debug, Default)]
pub struct OperationPool {
    free: Mutex<VecDeque<Box<OperationContext>>>,
    allocated: AtomicUsize,
}

impl OperationPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool with `capacity` contexts allocated up front.
    pub fn with_capacity(capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|_| Box::new(OperationContext::new()))
            .collect::<VecDeque<_>>();

        Self {
            free: Mutex::new(free),
            allocated: AtomicUsize::new(capacity),
        }
    }

    /// Takes the most recently released context, or allocates a new one.
    pub fn acquire(&self) -> Box<OperationContext> {
        if let Some(op) = self.lock().pop_front() {
            return op;
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        Box::new(OperationContext::new())
    }

    /// Returns a context to the front of the free list.
    ///
    /// The caller must have observed the completion of the operation the
    /// context was used for.
    pub fn release(&self, mut op: Box<OperationContext>) {
        op.reset();
        self.lock().push_front(op);
    }

    /// Number of contexts currently in the pool.
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    /// Number of contexts this pool has ever created.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Box<OperationContext>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
