// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Implementation of a ring buffer.

use crate::collections::queue;

/// Fixed-capacity FIFO over caller-provided storage.
///
/// Every slot of `ring` is usable, so a buffer over `[T; N]` holds up to `N`
/// elements.
pub struct RingBuffer<'a, T: 'a> {
    ring: &'a mut [T],
    head: usize,
    len: usize,
}

impl<'a, T: Copy> RingBuffer<'a, T> {
    pub fn new(ring: &'a mut [T]) -> RingBuffer<'a, T> {
        RingBuffer {
            ring,
            head: 0,
            len: 0,
        }
    }

    /// Returns the number of elements that can be enqueued until the ring
    /// buffer is full.
    pub fn available_len(&self) -> usize {
        self.ring.len() - self.len
    }

    /// Maximum number of elements the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.ring.len()
    }

    /// Apply `f` to queued elements from the front until it returns `true`.
    ///
    /// Returns `true` if some element accepted the update. The order of
    /// elements is never changed.
    pub fn update_first_matching<F>(&mut self, mut f: F) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        for offset in 0..self.len {
            let idx = self.slot(offset);
            if f(&mut self.ring[idx]) {
                return true;
            }
        }
        false
    }
}

impl<T: Copy> queue::Queue<T> for RingBuffer<'_, T> {
    fn has_elements(&self) -> bool {
        self.len != 0
    }

    fn is_full(&self) -> bool {
        self.len == self.ring.len()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn enqueue(&mut self, val: T) -> bool {
        if self.is_full() {
            false
        } else {
            let tail = self.slot(self.len);
            self.ring[tail] = val;
            self.len += 1;
            true
        }
    }

    fn push(&mut self, val: T) -> Option<T> {
        if self.ring.is_empty() {
            return Some(val);
        }
        let evicted = if self.is_full() {
            let old = self.ring[self.head];
            self.head = self.slot(1);
            self.len -= 1;
            Some(old)
        } else {
            None
        };
        let tail = self.slot(self.len);
        self.ring[tail] = val;
        self.len += 1;
        evicted
    }

    fn dequeue(&mut self) -> Option<T> {
        if self.has_elements() {
            let val = self.ring[self.head];
            self.head = self.slot(1);
            self.len -= 1;
            Some(val)
        } else {
            None
        }
    }

    fn remove_first_matching<F>(&mut self, f: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let found = (0..self.len).find(|&offset| f(&self.ring[self.slot(offset)]))?;
        let removed = self.ring[self.slot(found)];
        // Close the gap by shifting the later elements one slot forward.
        for offset in found..self.len - 1 {
            let (dst, src) = (self.slot(offset), self.slot(offset + 1));
            self.ring[dst] = self.ring[src];
        }
        self.len -= 1;
        Some(removed)
    }

    fn empty(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&T) -> bool,
    {
        let mut kept = 0;
        for offset in 0..self.len {
            let src = self.slot(offset);
            if f(&self.ring[src]) {
                let dst = self.slot(kept);
                if dst != src {
                    self.ring[dst] = self.ring[src];
                }
                kept += 1;
            }
        }
        self.len = kept;
    }
}

#[cfg(test)]
mod test {
    use super::super::queue::Queue;
    use super::RingBuffer;

    #[test]
    fn test_enqueue_dequeue() {
        const LEN: usize = 10;
        let mut ring = [0; LEN];
        let mut buf = RingBuffer::new(&mut ring);

        for _ in 0..2 * LEN {
            assert!(buf.enqueue(42));
            assert_eq!(buf.len(), 1);
            assert!(buf.has_elements());

            assert_eq!(buf.dequeue(), Some(42));
            assert_eq!(buf.len(), 0);
            assert!(!buf.has_elements());
        }
    }

    #[test]
    fn test_full_buffer_rejects_enqueue() {
        let mut ring = [0; 3];
        let mut buf = RingBuffer::new(&mut ring);
        assert!(buf.enqueue(1));
        assert!(buf.enqueue(2));
        assert!(buf.enqueue(3));
        assert!(buf.is_full());
        assert_eq!(buf.available_len(), 0);
        assert!(!buf.enqueue(4));
        assert_eq!(buf.dequeue(), Some(1));
        assert!(buf.enqueue(4));
        assert_eq!(buf.dequeue(), Some(2));
        assert_eq!(buf.dequeue(), Some(3));
        assert_eq!(buf.dequeue(), Some(4));
        assert_eq!(buf.dequeue(), None);
    }

    #[test]
    fn test_push() {
        let mut ring = [0; 4];
        let mut buf = RingBuffer::new(&mut ring);
        for i in 0..4 {
            assert_eq!(buf.push(i), None);
        }
        assert_eq!(buf.push(4), Some(0));
        assert_eq!(buf.push(5), Some(1));
        assert_eq!(buf.len(), 4);
        for expected in 2..6 {
            assert_eq!(buf.dequeue(), Some(expected));
        }
    }

    #[test]
    fn test_retain_across_wrap() {
        let mut ring = [0; 5];
        let mut buf = RingBuffer::new(&mut ring);
        // Move head forward so the contents wrap around the end of storage.
        for i in 0..3 {
            assert!(buf.enqueue(i));
            assert_eq!(buf.dequeue(), Some(i));
        }
        for i in 10..15 {
            assert!(buf.enqueue(i));
        }
        buf.retain(|&x| x % 2 == 0);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.dequeue(), Some(10));
        assert_eq!(buf.dequeue(), Some(12));
        assert_eq!(buf.dequeue(), Some(14));
        assert_eq!(buf.dequeue(), None);
    }

    #[test]
    fn test_remove_first_matching() {
        let mut ring = [0; 5];
        let mut buf = RingBuffer::new(&mut ring);
        for i in [1, 2, 3, 2, 5] {
            assert!(buf.enqueue(i));
        }
        assert_eq!(buf.remove_first_matching(|&x| x == 2), Some(2));
        assert_eq!(buf.remove_first_matching(|&x| x == 7), None);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.dequeue(), Some(1));
        assert_eq!(buf.dequeue(), Some(3));
        assert_eq!(buf.dequeue(), Some(2));
        assert_eq!(buf.dequeue(), Some(5));
    }

    #[test]
    fn test_update_first_matching_keeps_order() {
        let mut ring = [(0u8, 0u8); 4];
        let mut buf = RingBuffer::new(&mut ring);
        assert!(buf.enqueue((1, 10)));
        assert!(buf.enqueue((2, 20)));
        assert!(buf.enqueue((1, 30)));

        let updated = buf.update_first_matching(|entry| {
            if entry.0 == 1 {
                entry.1 = 99;
                true
            } else {
                false
            }
        });
        assert!(updated);
        assert!(!buf.update_first_matching(|entry| entry.0 == 3));

        assert_eq!(buf.dequeue(), Some((1, 99)));
        assert_eq!(buf.dequeue(), Some((2, 20)));
        assert_eq!(buf.dequeue(), Some((1, 30)));
    }

    #[test]
    fn test_empty() {
        let mut ring = [0; 3];
        let mut buf = RingBuffer::new(&mut ring);
        assert!(buf.enqueue(1));
        assert!(buf.enqueue(2));
        buf.empty();
        assert!(!buf.has_elements());
        assert_eq!(buf.dequeue(), None);
    }
}
