//! Fixed channel can-send-now queue
//!
//! Fixed channels (ATT, SM, ...) ask for a send opportunity instead of
//! queueing data. Requests are served oldest first so every channel gets a
//! turn while the controller is short on buffers.

use std::collections::VecDeque;

/// A fixed channel on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedChannelKey {
    pub handle: u16,
    pub cid: u16,
}

impl FixedChannelKey {
    pub fn new(handle: u16, cid: u16) -> Self {
        Self { handle, cid }
    }
}

/// FIFO of fixed channels waiting to send
#[derive(Debug, Default)]
pub struct FixedChannelFifo {
    queue: VecDeque<FixedChannelKey>,
}

impl FixedChannelFifo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key` unless it is already waiting
    ///
    /// Returns whether the key was added.
    pub fn mark_ready(&mut self, key: FixedChannelKey) -> bool {
        if self.queue.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Dequeue the oldest entry
    pub fn next_ready(&mut self) -> Option<FixedChannelKey> {
        self.queue.pop_front()
    }

    /// Dequeue the oldest entry accepted by `ready`, keeping the rest in order
    pub fn next_ready_where(&mut self, mut ready: impl FnMut(&FixedChannelKey) -> bool) -> Option<FixedChannelKey> {
        let position = self.queue.iter().position(|key| ready(key))?;
        self.queue.remove(position)
    }

    /// Drop every entry of a connection
    pub fn remove_handle(&mut self, handle: u16) {
        self.queue.retain(|key| key.handle != handle);
    }

    /// Drop every entry of a fixed channel
    pub fn remove_cid(&mut self, cid: u16) {
        self.queue.retain(|key| key.cid != cid);
    }

    pub fn contains(&self, key: &FixedChannelKey) -> bool {
        self.queue.contains(key)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_ready_is_idempotent() {
        let mut fifo = FixedChannelFifo::new();
        let key = FixedChannelKey::new(0x0040, 0x0004);

        assert!(fifo.mark_ready(key));
        assert!(!fifo.mark_ready(key));
        assert_eq!(fifo.len(), 1);
        assert_eq!(fifo.next_ready(), Some(key));
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_order_and_removal() {
        let mut fifo = FixedChannelFifo::new();
        let a = FixedChannelKey::new(0x0040, 0x0004);
        let b = FixedChannelKey::new(0x0041, 0x0004);
        let c = FixedChannelKey::new(0x0040, 0x0006);

        fifo.mark_ready(a);
        fifo.mark_ready(b);
        fifo.mark_ready(c);

        // Skips entries the predicate rejects without reordering them
        assert_eq!(fifo.next_ready_where(|key| key.handle == 0x0041), Some(b));

        fifo.mark_ready(b);
        fifo.remove_handle(0x0040);
        assert_eq!(fifo.next_ready(), Some(b));
        assert_eq!(fifo.next_ready(), None);
    }
}
