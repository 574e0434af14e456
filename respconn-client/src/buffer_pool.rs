//! Reusable write buffers.
//!
//! Purely an allocation optimisation: callers always get a usable buffer,
//! pooled when one is free and freshly allocated otherwise.

use bytes::BytesMut;
use parking_lot::Mutex;

/// A small pool of growable byte buffers.
pub struct BufferPool {
    slots: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    /// Creates a pool holding at most `max_pooled` idle buffers, none larger than
    /// `max_retained_capacity` bytes.
    pub fn new(max_pooled: usize, max_retained_capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            max_retained_capacity,
        }
    }

    /// Returns an empty buffer with capacity of at least `min_capacity`.
    pub fn acquire(&self, min_capacity: usize) -> BytesMut {
        let pooled = {
            let mut slots = self.slots.lock();
            // Oldest buffer that already fits, else the oldest one at all.
            match slots.iter().position(|b| b.capacity() >= min_capacity) {
                Some(idx) => Some(slots.remove(idx)),
                None if !slots.is_empty() => Some(slots.remove(0)),
                None => None,
            }
        };

        match pooled {
            Some(mut buf) => {
                buf.reserve(min_capacity);
                buf
            }
            None => BytesMut::with_capacity(min_capacity),
        }
    }

    /// Returns a buffer to the pool. Dropped if the pool is full or the buffer is oversized.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_retained_capacity {
            return;
        }
        buf.clear();
        let mut slots = self.slots.lock();
        if slots.len() < self.max_pooled {
            slots.push(buf);
        }
    }

    /// Returns the number of idle buffers.
    pub fn idle(&self) -> usize {
        self.slots.lock().len()
    }
}
