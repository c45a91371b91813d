//! Segment pool used by the dispatchers for socket reads.

use crate::sync::lock;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Configuration for the [`MemoryManager`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity of a freshly allocated segment (default: 16 KB)
    pub segment_size: usize,

    /// Maximum number of segments kept in the free list (default: 1024)
    pub max_pooled: usize,

    /// Segments with less spare capacity than this are dropped instead of
    /// pooled (default: 1 KB)
    pub min_reusable: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            segment_size: 16 * 1024,
            max_pooled: 1024,
            min_reusable: 1024,
        }
    }
}

/// Counters describing pool behaviour.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocated: u64,
    pub reused: u64,
    pub recycled: u64,
    pub discarded: u64,
    pub pooled: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allocated: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    free: Mutex<Vec<BytesMut>>,
    config: MemoryConfig,
    counters: Counters,
}

/// Thread-safe pool of writable buffer segments.
///
/// Cloning is cheap; all clones share the same free list.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::new()),
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Returns an empty segment with at least `min_size` bytes of capacity.
    pub fn acquire(&self, min_size: usize) -> BytesMut {
        let reused = {
            let mut free = lock(&self.inner.free);
            free.iter()
                .rposition(|segment| segment.capacity() >= min_size)
                .map(|index| free.swap_remove(index))
        };

        match reused {
            Some(segment) => {
                self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                segment
            }
            None => {
                self.inner.counters.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(min_size.max(self.inner.config.segment_size))
            }
        }
    }

    /// Gives a segment back to the pool.
    ///
    /// The segment is cleared first. If it has too little capacity left, or
    /// the pool is already at its cap, it is simply dropped.
    pub fn recycle(&self, mut segment: BytesMut) {
        segment.clear();
        if segment.capacity() < self.inner.config.min_reusable {
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut free = lock(&self.inner.free);
        if free.len() >= self.inner.config.max_pooled {
            drop(free);
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        free.push(segment);
        self.inner.counters.recycled.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of segments currently pooled.
    pub fn pooled(&self) -> usize {
        lock(&self.inner.free).len()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> MemoryStats {
        let counters = &self.inner.counters;
        MemoryStats {
            allocated: counters.allocated.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            recycled: counters.recycled.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            pooled: self.pooled(),
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::thread;

    #[test]
    fn test_acquire_allocates_segment_size() {
        let manager = MemoryManager::default();
        let segment = manager.acquire(10);
        assert!(segment.capacity() >= 16 * 1024);
        assert!(segment.is_empty());

        let big = manager.acquire(64 * 1024);
        assert!(big.capacity() >= 64 * 1024);
        assert_eq!(manager.stats().allocated, 2);
    }

    #[test]
    fn test_recycle_then_reuse() {
        let manager = MemoryManager::default();
        let mut segment = manager.acquire(100);
        segment.put_slice(b"hello");
        let capacity = segment.capacity();
        manager.recycle(segment);
        assert_eq!(manager.pooled(), 1);

        let again = manager.acquire(100);
        assert!(again.is_empty());
        assert_eq!(again.capacity(), capacity);
        assert_eq!(manager.stats().reused, 1);
        assert_eq!(manager.pooled(), 0);
    }

    #[test]
    fn test_small_segments_not_pooled() {
        let manager = MemoryManager::new(MemoryConfig {
            segment_size: 512,
            min_reusable: 1024,
            ..Default::default()
        });
        let segment = manager.acquire(1);
        manager.recycle(segment);
        assert_eq!(manager.pooled(), 0);
        assert_eq!(manager.stats().discarded, 1);
    }

    #[test]
    fn test_pool_cap_skips_pooling() {
        let manager = MemoryManager::new(MemoryConfig {
            max_pooled: 2,
            ..Default::default()
        });
        let segments: Vec<_> = (0..4).map(|_| manager.acquire(1)).collect();
        for segment in segments {
            manager.recycle(segment);
        }
        assert_eq!(manager.pooled(), 2);
        assert_eq!(manager.stats().discarded, 2);
    }

    #[test]
    fn test_too_small_pooled_segment_not_reused() {
        let manager = MemoryManager::default();
        manager.recycle(manager.acquire(1));
        let big = manager.acquire(1024 * 1024);
        assert!(big.capacity() >= 1024 * 1024);
        assert_eq!(manager.pooled(), 1);
    }

    #[test]
    fn test_concurrent_acquire_recycle() {
        let manager = MemoryManager::default();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let mut segment = manager.acquire(128);
                        segment.put_u64(42);
                        manager.recycle(segment);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.allocated + stats.reused, 2000);
        assert!(stats.pooled <= 4);
    }
}
