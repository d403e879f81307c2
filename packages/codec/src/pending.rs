//! Submitted operations awaiting synchronization.

use std::collections::VecDeque;

use crate::mfx::SyncToken;

/// An in-flight operation: the buffer it writes into and its completion token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCompletion<T> {
    pub item: T,
    pub token: SyncToken,
}

/// FIFO of in-flight operations.
///
/// The device completes operations in submission order, so consuming from
/// the head keeps outputs in order.
#[derive(Debug)]
pub struct PendingQueue<T> {
    queue: VecDeque<PendingCompletion<T>>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<T> PendingQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T, token: SyncToken) {
        self.queue.push_back(PendingCompletion { item, token });
    }

    /// Remove the oldest entry.
    pub fn pop(&mut self) -> Option<PendingCompletion<T>> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn front(&self) -> Option<&PendingCompletion<T>> {
        self.queue.front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True once `threshold` operations are outstanding.
    #[must_use]
    pub fn reached(&self, threshold: usize) -> bool {
        !self.queue.is_empty() && self.queue.len() >= threshold
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingCompletion<T>> {
        self.queue.iter()
    }
}
