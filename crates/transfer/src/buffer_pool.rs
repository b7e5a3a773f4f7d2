//! Bounded pool of reusable chunk buffers.
//!
//! The pool holds one slot per allowed in-flight chunk. A [`PooledBuffer`]
//! is exclusively owned by the chunk operation that acquired it; its bytes
//! cannot be handed to another chunk until the guard is dropped, which is
//! also what returns the slot. Acquisition suspends while every slot is
//! checked out, which is the backpressure that keeps a fast source from
//! racing ahead of the network.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::TransferError;

struct Slot {
    buffer: Vec<u8>,
    in_use: bool,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
}

/// Fixed set of `size` buffers of `capacity` bytes each.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool. Memory is allocated lazily on first use of each slot.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize, capacity: usize) -> Self {
        assert!(size > 0, "BufferPool size must be > 0");
        let slots = (0..size)
            .map(|_| Slot {
                buffer: Vec::new(),
                in_use: false,
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(size)),
                slots: Mutex::new(slots),
                capacity,
            }),
        }
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.lock_slots().len()
    }

    /// Capacity of each buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots not currently checked out.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Waits for a free slot and checks it out.
    pub async fn acquire(&self) -> Result<PooledBuffer, TransferError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ResourceExhausted("buffer pool closed".into()))?;

        let mut slots = self.lock_slots();
        let id = slots.iter().position(|s| !s.in_use).ok_or_else(|| {
            TransferError::ResourceExhausted("permit granted while every slot is in use".into())
        })?;
        let slot = &mut slots[id];
        slot.in_use = true;
        let mut buffer = std::mem::take(&mut slot.buffer);
        buffer.clear();
        buffer.reserve(self.inner.capacity);
        drop(slots);

        Ok(PooledBuffer {
            id,
            buffer,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out pool slot. Returned to the pool on drop, on every path.
pub struct PooledBuffer {
    id: usize,
    buffer: Vec<u8>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    /// Slot id, unique among concurrently held buffers.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        let mut slots = self.pool.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(self.id) {
            slot.buffer = buffer;
            slot.in_use = false;
        }
        // The permit is released after this body runs, so a waiter never
        // observes the slot still flagged in use.
    }
}
