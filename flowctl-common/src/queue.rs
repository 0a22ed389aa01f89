use std::collections::VecDeque;

use parking_lot::Mutex;

/// A bounded multi-producer queue that never blocks its producers.
///
/// When the queue is full, [`push`](Self::push) evicts the oldest entry to make room for
/// the new one. The newest entry is never the one dropped, and the queue never grows past
/// its capacity.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
}

impl<T> BoundedQueue<T> {
    /// Creates a new queue holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self { capacity, inner: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Pushes an entry, returning the evicted oldest entry if the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let mut inner = self.inner.lock();

        let evicted = if inner.len() == self.capacity { inner.pop_front() } else { None };
        inner.push_back(item);

        evicted
    }

    /// Removes and returns the oldest entry, if any.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Removes every queued entry, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
