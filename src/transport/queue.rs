//! Ordered byte buffer shared between the application and the tick loop.

use std::collections::VecDeque;

/// Strict FIFO byte queue: the first byte pushed is the first byte popped.
///
/// Two instances exist per transport — one accumulating outbound bytes
/// from the application, one accumulating bytes reassembled from the
/// link. Neither enforces a capacity; backpressure is the application's
/// concern. The queues outlive any single connection.
#[derive(Debug, Default)]
pub struct ByteQueue {
    bytes: VecDeque<u8>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte to the tail.
    pub fn push(&mut self, byte: u8) {
        self.bytes.push_back(byte);
    }

    /// Append a slice of bytes in order.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend(bytes.iter().copied());
    }

    /// Remove and return the oldest byte.
    pub fn pop(&mut self) -> Option<u8> {
        self.bytes.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_ordering() {
        let mut queue = ByteQueue::new();
        for b in 0u8..10 {
            queue.push(b);
        }
        for b in 0u8..10 {
            assert_eq!(queue.pop(), Some(b));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_extend_preserves_order() {
        let mut queue = ByteQueue::new();
        queue.push(1);
        queue.extend(&[2, 3, 4]);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_empty() {
        let mut queue = ByteQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.pop(), None);
    }
}
