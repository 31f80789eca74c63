//! Object pool behaviour under reuse and contention.

use luceria::pool::ObjectPool;
use std::sync::Arc;

#[test]
fn test_slots_recycle() {
    let pool: Arc<ObjectPool<String>> = ObjectPool::new();
    {
        let mut s = pool.allocate().unwrap();
        s.push_str("hello");
    }
    assert_eq!(pool.free_count(), 1);
    assert_eq!(pool.live(), 0);
}

#[test]
fn test_dirty_allocation_keeps_capacity() {
    let pool: Arc<ObjectPool<Vec<u8>>> = ObjectPool::new();
    let cap = {
        let mut v = pool.allocate_dirty(Vec::new).unwrap();
        v.reserve(1024);
        v.capacity()
    };
    assert!(cap >= 1024);

    // Drain every bucket until the recycled slot shows up again.
    let mut recovered = false;
    for _ in 0..64 {
        let v = pool.allocate_dirty(Vec::new).unwrap();
        if v.capacity() >= 1024 {
            recovered = true;
            break;
        }
    }
    assert!(recovered);
}

#[test]
fn test_local_handle_flush_on_drop() {
    let pool: Arc<ObjectPool<u64>> = ObjectPool::new();
    {
        let mut local = pool.local();
        let a = local.allocate().unwrap();
        let b = local.allocate().unwrap();
        local.free(a);
        local.free(b);
        assert_eq!(pool.free_count(), 0);
    }
    // The buffered slots reached the shared buckets when the handle died.
    assert_eq!(pool.free_count(), 2);
}

#[test]
fn test_contended_allocation() {
    let pool: Arc<ObjectPool<Vec<u64>>> = ObjectPool::new();
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    let mut v = pool.allocate().unwrap();
                    v.push(i);
                    assert_eq!(v.len(), 1);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(pool.live(), 0);
    assert!(pool.free_count() > 0);
}
