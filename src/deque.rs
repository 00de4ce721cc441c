//! Per-worker double-ended work queue.
//!
//! # Contract
//!
//! Each deque has one **owner** worker and any number of **thieves**:
//!
//! - The owner pushes and pops at the **bottom** (tail). Back-to-back pushes
//!   of A then B are popped B-first, so the owner works LIFO and stays on
//!   the cache-warm end.
//! - Thieves take from the **top** (head), so stealing drains the oldest
//!   work FIFO and leaves the owner's recent items alone.
//!
//! `push_bottom` is callable from any thread; this is what lets a submitter
//! target a specific worker's queue. That requirement is also why this is a
//! single-mutex `VecDeque` rather than a Chase-Lev deque, whose bottom end
//! is owner-only by construction.
//!
//! Every item pushed is either popped or stolen exactly once. `is_empty` is
//! best-effort: it may be stale by the time the caller acts on it, but it
//! never reports non-empty for a deque that was empty throughout the call.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Mutex-protected double-ended queue with owner/thief discipline.
#[derive(Debug)]
pub struct WorkDeque<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkDeque<T> {
    /// Create an empty deque.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an item at the bottom. Callable from any thread; never fails.
    pub fn push_bottom(&self, item: T) {
        let mut q = self.inner.lock().expect("deque mutex poisoned");
        q.push_back(item);
    }

    /// Remove and return the bottom item. Owner-called.
    ///
    /// Returns `None` when the deque is empty.
    pub fn pop_bottom(&self) -> Option<T> {
        let mut q = self.inner.lock().expect("deque mutex poisoned");
        q.pop_back()
    }

    /// Remove and return the top item. Safe under concurrent callers.
    ///
    /// Returns `None` when the deque is empty.
    pub fn steal_top(&self) -> Option<T> {
        let mut q = self.inner.lock().expect("deque mutex poisoned");
        q.pop_front()
    }

    /// Best-effort emptiness check. May be stale under concurrency.
    pub fn is_empty(&self) -> bool {
        let q = self.inner.lock().expect("deque mutex poisoned");
        q.is_empty()
    }

    /// Current length. Observational only; stale under concurrency.
    pub fn len(&self) -> usize {
        let q = self.inner.lock().expect("deque mutex poisoned");
        q.len()
    }
}
