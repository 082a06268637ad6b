//! Bucketed byte-buffer pool

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Fixed bucket sizes: 1 KiB, 4 KiB, 16 KiB, 64 KiB
const BUCKET_SIZES: [usize; 4] = [1024, 4096, 16384, 65536];

/// Retained buffers per bucket
const MAX_PER_BUCKET: usize = 50;

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferPoolStats {
    pub acquires: u64,
    pub releases: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Pooled buffer count per bucket size
    pub bucket_depths: HashMap<usize, usize>,
}

/// Pools byte buffers in fixed size buckets
///
/// `acquire` returns the smallest bucket that fits; requests beyond the
/// largest bucket get the largest. Buffers released with a foreign capacity
/// are dropped rather than pooled.
pub struct BufferPool {
    buckets: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    acquires: AtomicU64,
    releases: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        let mut buckets = HashMap::new();
        for size in BUCKET_SIZES {
            buckets.insert(size, Vec::new());
        }
        Self {
            buckets: Mutex::new(buckets),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Bucket size used for a request of `min_size` bytes.
    pub fn bucket_for(min_size: usize) -> usize {
        BUCKET_SIZES
            .iter()
            .copied()
            .find(|&s| s >= min_size)
            .unwrap_or(BUCKET_SIZES[BUCKET_SIZES.len() - 1])
    }

    /// Take an empty buffer with capacity for at least `min_size` bytes
    /// (capped at the largest bucket).
    pub fn acquire(&self, min_size: usize) -> Vec<u8> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        let bucket = Self::bucket_for(min_size);

        if let Some(buffer) = self
            .buckets
            .lock()
            .get_mut(&bucket)
            .and_then(|pool| pool.pop())
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            buffer
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(bucket)
        }
    }

    /// Return a buffer. Cleared, then pooled by its capacity; foreign
    /// capacities and overflow beyond the bucket cap are silently dropped.
    pub fn release(&self, mut buffer: Vec<u8>) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        buffer.clear();

        let mut buckets = self.buckets.lock();
        if let Some(pool) = buckets.get_mut(&buffer.capacity()) {
            if pool.len() < MAX_PER_BUCKET {
                pool.push(buffer);
            }
        }
    }

    /// Fill every bucket with `count` buffers.
    pub fn prewarm(&self, count: usize) {
        let mut buckets = self.buckets.lock();
        for size in BUCKET_SIZES {
            let pool = buckets.get_mut(&size).expect("bucket exists");
            while pool.len() < count.min(MAX_PER_BUCKET) {
                pool.push(Vec::with_capacity(size));
            }
        }
    }

    pub fn clear(&self) {
        for pool in self.buckets.lock().values_mut() {
            pool.clear();
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let acquires = self.acquires.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        BufferPoolStats {
            acquires,
            releases: self.releases.load(Ordering::Relaxed),
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: if acquires > 0 {
                hits as f64 / acquires as f64
            } else {
                0.0
            },
            bucket_depths: self
                .buckets
                .lock()
                .iter()
                .map(|(size, pool)| (*size, pool.len()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_selection() {
        assert_eq!(BufferPool::bucket_for(1), 1024);
        assert_eq!(BufferPool::bucket_for(1024), 1024);
        assert_eq!(BufferPool::bucket_for(1025), 4096);
        assert_eq!(BufferPool::bucket_for(50_000), 65536);
        // Oversized requests fall back to the largest bucket.
        assert_eq!(BufferPool::bucket_for(1_000_000), 65536);
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = BufferPool::new();

        let mut buffer = pool.acquire(2000);
        assert!(buffer.capacity() >= 4096);
        buffer.extend_from_slice(b"payload");
        pool.release(buffer);

        let again = pool.acquire(3000);
        assert!(again.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_foreign_capacity_not_pooled() {
        let pool = BufferPool::new();
        pool.release(Vec::with_capacity(123));

        let stats = pool.stats();
        assert!(stats.bucket_depths.values().all(|&depth| depth == 0));
    }

    #[test]
    fn test_prewarm_fills_buckets() {
        let pool = BufferPool::new();
        pool.prewarm(10);

        let stats = pool.stats();
        for size in BUCKET_SIZES {
            assert_eq!(stats.bucket_depths[&size], 10);
        }
    }
}
