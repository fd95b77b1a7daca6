//! Bounded in-memory history of recent messages.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::types::ChatMessage;

/// Holds the most recent N messages in arrival order, available for
/// instant replay to new subscribers without a storage round-trip.
///
/// Eviction is strict FIFO: once full, every append removes the oldest
/// entry. Snapshots take a read lock, so they never observe a partial
/// append and may run concurrently with each other.
pub struct HistoryCache {
    entries: RwLock<VecDeque<ChatMessage>>,
    capacity: usize,
}

impl HistoryCache {
    /// Create an empty cache bounded to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append to the tail, evicting from the head once over capacity.
    pub fn append(&self, message: ChatMessage) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(message);
    }

    /// Bulk-load messages at boot, oldest first. Applies the same
    /// capacity bound as [`append`](Self::append).
    pub fn seed(&self, messages: Vec<ChatMessage>) {
        let mut entries = self.entries.write();
        for message in messages {
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(message);
        }
    }

    /// Ordered copy of the cached messages, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
