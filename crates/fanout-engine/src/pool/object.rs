//! Generic object pool

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// An object that can be recycled through an [`ObjectPool`]
pub trait Poolable {
    /// Clear all state from a previous use.
    fn reset(&mut self);
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectPoolStats {
    pub created: u64,
    pub available: usize,
    pub acquires: u64,
    pub releases: u64,
    /// Acquires served from the pool
    pub hits: u64,
    /// Acquires that had to construct a new object
    pub misses: u64,
    /// Releases dropped because the pool was full
    pub disposed: u64,
    pub hit_rate: f64,
}

/// Reuses objects instead of allocating new ones
///
/// # Example
///
/// ```
/// use fanout_engine::pool::{ObjectPool, Poolable};
///
/// #[derive(Default)]
/// struct Scratch(Vec<u8>);
/// impl Poolable for Scratch {
///     fn reset(&mut self) {
///         self.0.clear();
///     }
/// }
///
/// let pool = ObjectPool::new(Scratch::default, 16);
/// let scratch = pool.acquire();
/// pool.release(scratch);
/// ```
pub struct ObjectPool<T: Poolable> {
    factory: Box<dyn Fn() -> T + Send + Sync>,
    available: Mutex<Vec<T>>,
    max_size: usize,
    created: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    disposed: AtomicU64,
}

const DEFAULT_MAX_SIZE: usize = 200;

impl<T: Poolable> ObjectPool<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static, max_size: usize) -> Self {
        Self {
            factory: Box::new(factory),
            available: Mutex::new(Vec::new()),
            max_size: max_size.max(1),
            created: AtomicU64::new(0),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        }
    }

    pub fn with_default_size(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::new(factory, DEFAULT_MAX_SIZE)
    }

    /// Take an object, reusing a pooled one when available.
    pub fn acquire(&self) -> T {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        if let Some(obj) = self.available.lock().pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            obj
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        }
    }

    /// Return an object. It is reset before it becomes available again;
    /// beyond `max_size` it is simply dropped.
    pub fn release(&self, mut obj: T) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        obj.reset();

        let mut available = self.available.lock();
        if available.len() < self.max_size {
            available.push(obj);
        } else {
            self.disposed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pre-construct `count` objects (bounded by the pool size).
    pub fn prewarm(&self, count: usize) {
        let mut available = self.available.lock();
        let target = (available.len() + count).min(self.max_size);
        while available.len() < target {
            self.created.fetch_add(1, Ordering::Relaxed);
            available.push((self.factory)());
        }
    }

    pub fn clear(&self) {
        self.available.lock().clear();
    }

    pub fn available(&self) -> usize {
        self.available.lock().len()
    }

    pub fn stats(&self) -> ObjectPoolStats {
        let acquires = self.acquires.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        ObjectPoolStats {
            created: self.created.load(Ordering::Relaxed),
            available: self.available(),
            acquires,
            releases: self.releases.load(Ordering::Relaxed),
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            hit_rate: if acquires > 0 {
                hits as f64 / acquires as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        data: Vec<u8>,
    }

    impl Poolable for Scratch {
        fn reset(&mut self) {
            self.data.clear();
        }
    }

    #[test]
    fn test_acquire_miss_then_hit() {
        let pool = ObjectPool::new(Scratch::default, 8);

        let obj = pool.acquire();
        pool.release(obj);
        let _again = pool.acquire();

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_release_resets_state() {
        let pool = ObjectPool::new(Scratch::default, 8);

        let mut obj = pool.acquire();
        obj.data.extend_from_slice(b"leftovers");
        pool.release(obj);

        assert!(pool.acquire().data.is_empty());
    }

    #[test]
    fn test_overflow_is_disposed() {
        let pool = ObjectPool::new(Scratch::default, 1);

        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().disposed, 1);
    }

    #[test]
    fn test_prewarm_bounded_by_max() {
        let pool = ObjectPool::new(Scratch::default, 4);
        pool.prewarm(100);
        assert_eq!(pool.available(), 4);
    }
}
