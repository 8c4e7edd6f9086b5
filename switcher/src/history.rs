use serde::Serialize;
use std::collections::VecDeque;

/// Append-only sequence with a fixed capacity; the oldest entry is evicted
/// when a push would exceed it.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct BoundedHistory<T> {
    #[serde(skip)]
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns the evicted entry, if any.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    /// The `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &T> {
        self.entries.iter().rev().take(n)
    }
}
