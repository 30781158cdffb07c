//! The fixed-capacity byte buffer shared by both transfer directions.
//!
//! All mutation happens under a short-hold lock. The lock is never held
//! across anything but bookkeeping and a copy bounded by the capacity, so
//! callers must not hand in unbounded data.
use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Default buffer capacity, 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// [`BoundedBuffer`] is a byte FIFO with a fixed capacity.
///
/// The backing storage is allocated once. Consuming from the front moves the
/// remainder down, so appends never reallocate.
pub struct BoundedBuffer {
    capacity: usize,
    // Mirrors `storage.len()`, published while the lock is held.
    used: AtomicUsize,
    storage: Mutex<BytesMut>,
}

impl std::fmt::Debug for BoundedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedBuffer")
            .field("capacity", &self.capacity)
            .field("used", &self.len())
            .finish()
    }
}

impl BoundedBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    ///
    /// ### Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");
        Self {
            capacity,
            used: AtomicUsize::new(0),
            storage: Mutex::new(BytesMut::with_capacity(capacity)),
        }
    }

    /// Append as much of `data` as fits.
    ///
    /// Returns the number of bytes copied, `min(data.len(), free_space())`.
    pub fn append(&self, data: &[u8]) -> usize {
        let mut storage = self.storage.lock();
        let n = cmp::min(data.len(), self.capacity - storage.len());
        if n > 0 {
            storage.extend_from_slice(&data[..n]);
            self.used.store(storage.len(), Ordering::Release);
        }
        n
    }

    /// Remove and return up to `max_len` bytes from the front.
    ///
    /// Returns an empty [`Bytes`] if the buffer is empty.
    pub fn consume(&self, max_len: usize) -> Bytes {
        let mut storage = self.storage.lock();
        let n = cmp::min(max_len, storage.len());
        if n == 0 {
            return Bytes::new();
        }
        let out = Bytes::copy_from_slice(&storage[..n]);
        let rest = storage.len() - n;
        if rest > 0 {
            storage.copy_within(n.., 0);
        }
        storage.truncate(rest);
        self.used.store(rest, Ordering::Release);
        out
    }

    /// Returns the capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffered bytes.
    ///
    /// This is a snapshot; re-check under the lock (by calling a mutator)
    /// before relying on it.
    pub fn len(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Returns true if nothing is buffered. Snapshot, see [`BoundedBuffer::len`].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes that can be appended. Snapshot, see
    /// [`BoundedBuffer::len`].
    pub fn free_space(&self) -> usize {
        self.capacity - self.len()
    }
}
