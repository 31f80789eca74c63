//! Bucketed object pool.
//!
//! A pool keeps freed objects in a set of buckets, each behind its own lock.
//! Allocation and deallocation rotate the bucket index in opposite
//! directions through atomic counters, spreading contention without any
//! hashing. A thread-local handle buffers deallocations up to a threshold
//! before flushing them to the shared buckets. Freed objects are stored
//! whole: their teardown is deferred until the slot is reused, which lets
//! hot paths swap large trees without paying for the drop immediately.

use crate::errors::PoolError;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Number of buckets; kept a power of two so rotation is a mask.
const BUCKET_COUNT: usize = 8;

/// How many frees a local handle buffers before flushing.
const LOCAL_FLUSH_THRESHOLD: usize = 16;

/// Upper bound on live objects; a backstop against runaway allocation.
const MAX_LIVE: usize = 1 << 24;

struct Bucket<T> {
    free: Vec<Box<T>>,
}

/// Shared pool of `T` instances.
pub struct ObjectPool<T> {
    buckets: Vec<Mutex<Bucket<T>>>,
    alloc_counter: AtomicUsize,
    dealloc_counter: AtomicUsize,
    live: AtomicUsize,
}

impl<T: Default> ObjectPool<T> {
    /// Allocates an object, reusing a freed slot when one is available. The
    /// recycled object is reset through `Default`, which is the deferred
    /// destruction point of whatever the slot held before.
    pub fn allocate(self: &Arc<Self>) -> Result<PoolBox<T>, PoolError> {
        let live = self.live.fetch_add(1, Ordering::Relaxed);
        if live >= MAX_LIVE {
            self.live.fetch_sub(1, Ordering::Relaxed);
            return Err(PoolError::Exhausted(live));
        }

        let index = self.alloc_counter.fetch_add(1, Ordering::Relaxed) & (BUCKET_COUNT - 1);
        let recycled = self.buckets[index].lock().unwrap().free.pop();
        let value = match recycled {
            Some(mut slot) => {
                *slot = T::default();
                slot
            }
            None => Box::new(T::default()),
        };
        Ok(PoolBox {
            value: Some(value),
            pool: Arc::clone(self),
        })
    }
}

impl<T> ObjectPool<T> {
    pub fn new() -> Arc<ObjectPool<T>> {
        Arc::new(ObjectPool {
            buckets: (0..BUCKET_COUNT)
                .map(|_| Mutex::new(Bucket { free: Vec::new() }))
                .collect(),
            alloc_counter: AtomicUsize::new(0),
            dealloc_counter: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        })
    }

    /// Number of objects currently handed out.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Number of objects parked in the freelists.
    pub fn free_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().unwrap().free.len())
            .sum()
    }

    /// Allocates without resetting a recycled slot: the caller receives the
    /// object exactly as it was freed and owns its cleanup. This is the
    /// deferred-destruction path for containers that want to keep their
    /// capacity across reuse.
    pub fn allocate_dirty(self: &Arc<Self>, init: impl FnOnce() -> T) -> Result<PoolBox<T>, PoolError> {
        let live = self.live.fetch_add(1, Ordering::Relaxed);
        if live >= MAX_LIVE {
            self.live.fetch_sub(1, Ordering::Relaxed);
            return Err(PoolError::Exhausted(live));
        }
        let index = self.alloc_counter.fetch_add(1, Ordering::Relaxed) & (BUCKET_COUNT - 1);
        let recycled = self.buckets[index].lock().unwrap().free.pop();
        let value = match recycled {
            Some(slot) => slot,
            None => Box::new(init()),
        };
        Ok(PoolBox {
            value: Some(value),
            pool: Arc::clone(self),
        })
    }

    fn deallocate(&self, value: Box<T>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        let index = self.dealloc_counter.fetch_sub(1, Ordering::Relaxed) & (BUCKET_COUNT - 1);
        self.buckets[index].lock().unwrap().free.push(value);
    }

    /// Creates a thread-local handle that batches frees.
    pub fn local(self: &Arc<Self>) -> LocalPool<T> {
        LocalPool {
            pool: Arc::clone(self),
            buffer: Vec::new(),
        }
    }
}

/// Owned handle to a pooled object; returns the slot on drop.
pub struct PoolBox<T> {
    value: Option<Box<T>>,
    pool: Arc<ObjectPool<T>>,
}

impl<T> Deref for PoolBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().unwrap()
    }
}

impl<T> DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap()
    }
}

impl<T> Drop for PoolBox<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.deallocate(value);
        }
    }
}

/// Per-thread deallocation buffer limiting cross-thread contention.
pub struct LocalPool<T> {
    pool: Arc<ObjectPool<T>>,
    buffer: Vec<Box<T>>,
}

impl<T: Default> LocalPool<T> {
    /// Allocates, preferring the local buffer over the shared buckets.
    pub fn allocate(&mut self) -> Result<PoolBox<T>, PoolError> {
        if let Some(mut slot) = self.buffer.pop() {
            let live = self.pool.live.fetch_add(1, Ordering::Relaxed);
            if live >= MAX_LIVE {
                self.pool.live.fetch_sub(1, Ordering::Relaxed);
                return Err(PoolError::Exhausted(live));
            }
            *slot = T::default();
            return Ok(PoolBox {
                value: Some(slot),
                pool: Arc::clone(&self.pool),
            });
        }
        self.pool.allocate()
    }

    /// Frees into the local buffer, flushing to the shared pool past the
    /// threshold.
    pub fn free(&mut self, mut value: PoolBox<T>) {
        if let Some(boxed) = value.value.take() {
            self.pool.live.fetch_sub(1, Ordering::Relaxed);
            self.buffer.push(boxed);
        }
        if self.buffer.len() >= LOCAL_FLUSH_THRESHOLD {
            // Not counted as live anymore; hand the raw slots back.
            let pool = Arc::clone(&self.pool);
            let index = pool.dealloc_counter.fetch_sub(1, Ordering::Relaxed) & (BUCKET_COUNT - 1);
            pool.buckets[index]
                .lock()
                .unwrap()
                .free
                .append(&mut self.buffer);
        }
    }
}

impl<T> Drop for LocalPool<T> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            let index = self
                .pool
                .dealloc_counter
                .fetch_sub(1, Ordering::Relaxed)
                & (BUCKET_COUNT - 1);
            self.pool.buckets[index]
                .lock()
                .unwrap()
                .free
                .append(&mut self.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_reuse() {
        let pool: Arc<ObjectPool<Vec<u64>>> = ObjectPool::new();
        {
            let mut a = pool.allocate().unwrap();
            a.push(1);
            assert_eq!(pool.live(), 1);
        }
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.free_count(), 1);

        // The recycled slot comes back reset.
        let mut found_empty = false;
        for _ in 0..BUCKET_COUNT {
            let b = pool.allocate().unwrap();
            if b.is_empty() {
                found_empty = true;
            }
        }
        assert!(found_empty);
    }

    #[test]
    fn test_rotation_spreads_buckets() {
        let pool: Arc<ObjectPool<u64>> = ObjectPool::new();
        let boxes: Vec<_> = (0..BUCKET_COUNT * 2)
            .map(|_| pool.allocate().unwrap())
            .collect();
        drop(boxes);
        // Frees rotate across buckets rather than piling on one.
        let occupied = pool
            .buckets
            .iter()
            .filter(|b| !b.lock().unwrap().free.is_empty())
            .count();
        assert!(occupied > 1);
    }

    #[test]
    fn test_local_pool_buffers() {
        let pool: Arc<ObjectPool<u64>> = ObjectPool::new();
        let mut local = pool.local();
        let a = local.allocate().unwrap();
        local.free(a);
        // Below the threshold nothing reaches the shared buckets.
        assert_eq!(pool.free_count(), 0);
        let b = local.allocate().unwrap();
        drop(b);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_concurrent_use() {
        let pool: Arc<ObjectPool<u64>> = ObjectPool::new();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut v = pool.allocate().unwrap();
                        *v += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.live(), 0);
    }
}
