//! Fixed-capacity circular byte buffer
//!
//! Accumulates raw PCM until a full encoder frame is available and holds
//! the partial tail until the final flush. Single owner, no locking.

use crate::error::AudioError;

/// Circular byte store.
///
/// Readable data occupies `[data_start, data_start + remaining_read)` modulo
/// the capacity; everything else is writable.
pub struct RingBuffer {
    storage: Box<[u8]>,
    data_start: usize,
    remaining_read: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity in bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            data_start: 0,
            remaining_read: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes available to `get`
    pub fn remaining_read(&self) -> usize {
        self.remaining_read
    }

    /// Bytes that can still be `put`
    pub fn remaining_write(&self) -> usize {
        self.capacity() - self.remaining_read
    }

    pub fn is_empty(&self) -> bool {
        self.remaining_read == 0
    }

    pub fn is_full(&self) -> bool {
        self.remaining_write() == 0
    }

    /// Append all of `data`.
    ///
    /// Fails with `Overflow` and leaves the buffer untouched if `data` does
    /// not fit into the writable space.
    pub fn put(&mut self, data: &[u8]) -> Result<(), AudioError> {
        if data.len() > self.remaining_write() {
            return Err(AudioError::Overflow {
                requested: data.len(),
                available: self.remaining_write(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let capacity = self.capacity();
        let write_start = (self.data_start + self.remaining_read) % capacity;
        let until_end = capacity - write_start;

        if data.len() <= until_end {
            self.storage[write_start..write_start + data.len()].copy_from_slice(data);
        } else {
            let (tail, head) = data.split_at(until_end);
            self.storage[write_start..].copy_from_slice(tail);
            self.storage[..head.len()].copy_from_slice(head);
        }

        self.remaining_read += data.len();
        Ok(())
    }

    /// Append as much of `data` as fits and return the number of bytes taken.
    pub fn put_partial(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining_write());
        // cannot overflow, n is bounded by remaining_write
        let _ = self.put(&data[..n]);
        n
    }

    /// Fill `target` completely from the front of the buffer.
    ///
    /// Fails with `Underflow` and leaves the buffer untouched if fewer than
    /// `target.len()` bytes are readable.
    pub fn get_into(&mut self, target: &mut [u8]) -> Result<(), AudioError> {
        let count = target.len();
        if count > self.remaining_read {
            return Err(AudioError::Underflow {
                requested: count,
                available: self.remaining_read,
            });
        }
        if count == 0 {
            return Ok(());
        }

        let capacity = self.capacity();
        let until_end = capacity - self.data_start;

        if count <= until_end {
            target.copy_from_slice(&self.storage[self.data_start..self.data_start + count]);
        } else {
            let (tail, head) = target.split_at_mut(until_end);
            tail.copy_from_slice(&self.storage[self.data_start..]);
            head.copy_from_slice(&self.storage[..head.len()]);
        }

        self.data_start = (self.data_start + count) % capacity;
        self.remaining_read -= count;
        Ok(())
    }

    /// Take `count` bytes from the front of the buffer.
    pub fn get(&mut self, count: usize) -> Result<Vec<u8>, AudioError> {
        if count > self.remaining_read {
            return Err(AudioError::Underflow {
                requested: count,
                available: self.remaining_read,
            });
        }
        let mut out = vec![0u8; count];
        self.get_into(&mut out)?;
        Ok(out)
    }

    /// Discard all readable data
    pub fn clear(&mut self) {
        self.data_start = 0;
        self.remaining_read = 0;
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        if self.capacity() == 0 {
            return 0.0;
        }
        self.remaining_read as f32 / self.capacity() as f32
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("data_start", &self.data_start)
            .field("remaining_read", &self.remaining_read)
            .finish()
    }
}
