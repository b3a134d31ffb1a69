//! Fixed-capacity staging buffer with flush-on-full and flush-on-drain.

use std::collections::TryReserveError;

#[derive(Debug, Clone)]
pub struct StagingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    flushes: usize,
}

impl<T: Copy> StagingBuffer<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            flushes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Number of non-empty flushes so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Append one item. Returns `true` once the buffer is full; the caller
    /// must flush before pushing again.
    pub fn push(&mut self, item: T) -> bool {
        debug_assert!(!self.is_full(), "push into a full staging buffer");
        self.slots.push(item);
        self.is_full()
    }

    /// Hand the buffered items to `sink` in insertion order and reset the
    /// cursor. Empty buffers are not handed over. On error the items stay
    /// buffered.
    pub fn flush<E>(&mut self, sink: impl FnOnce(&[T]) -> Result<(), E>) -> Result<(), E> {
        if self.slots.is_empty() {
            return Ok(());
        }
        sink(&self.slots)?;
        self.slots.clear();
        self.flushes += 1;
        Ok(())
    }
}

/// Append `items` to `dest`, reserving first so a failed allocation leaves
/// `dest` untouched.
pub fn append<T: Copy>(dest: &mut Vec<T>, items: &[T]) -> Result<(), TryReserveError> {
    dest.try_reserve(items.len())?;
    dest.extend_from_slice(items);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_when_full_and_on_drain() {
        let mut buf = StagingBuffer::new(2);
        let mut out: Vec<u32> = Vec::new();
        for x in 0..5u32 {
            if buf.push(x) {
                buf.flush(|items| append(&mut out, items)).unwrap();
            }
        }
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(buf.len(), 1);
        buf.flush(|items| append(&mut out, items)).unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(buf.is_empty());
        assert_eq!(buf.flushes(), 3);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let mut buf: StagingBuffer<u8> = StagingBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        let mut called = false;
        buf.flush::<()>(|_| {
            called = true;
            Ok(())
        })
        .unwrap();
        assert!(!called);
        assert_eq!(buf.flushes(), 0);
    }

    #[test]
    fn failed_sink_keeps_items() {
        let mut buf = StagingBuffer::new(4);
        buf.push(7u8);
        assert!(buf.flush(|_| Err("nope")).is_err());
        assert_eq!(buf.len(), 1);
    }
}
