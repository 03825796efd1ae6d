//! Bounded FIFO buffer for messages that cannot be sent yet.

use std::collections::VecDeque;

/// Insertion-ordered queue with oldest-first eviction.
///
/// Entries leave the queue only through [`OfflineQueue::pop_front`] or by
/// eviction; every evicted entry is handed back to the caller so its owner
/// can be told.
#[derive(Debug)]
pub struct OfflineQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> OfflineQueue<T> {
    /// An empty queue holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an entry, returning the oldest entry if it had to be evicted.
    pub fn enqueue(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Put an entry back at the head, e.g. after a failed hand-off.
    ///
    /// Returns the newest entry if the queue overflowed.
    pub fn push_front(&mut self, entry: T) -> Option<T> {
        self.entries.push_front(entry);
        if self.entries.len() > self.capacity {
            self.entries.pop_back()
        } else {
            None
        }
    }

    /// Place `entries` ahead of everything already queued, keeping their
    /// order.
    ///
    /// If the result exceeds capacity the oldest entries are evicted; they
    /// are returned oldest first.
    pub fn requeue_front(&mut self, entries: Vec<T>) -> Vec<T> {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
        let overflow = self.entries.len().saturating_sub(self.capacity);
        self.entries.drain(..overflow).collect()
    }

    /// Remove the oldest entry.
    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..)
    }

    /// Iterate oldest first without removing.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
