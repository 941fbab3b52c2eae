//! Global cache memory accounting and least-recently-used eviction.
//!
//! Every cache registers itself with the graph's [`MemoryManager`]. After a
//! cache stores new data it calls [`MemoryManager::enforce`]; when the total
//! exceeds the budget, blocks are evicted oldest-first across all caches
//! until usage drops to [`TARGET_FRACTION`] of the budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::roi::BlockIndex;

/// Eviction stops once usage is at or below this share of the budget.
pub const TARGET_FRACTION: f64 = 0.8;

/// One evictable block as reported by a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Block index within the cache.
    pub block: BlockIndex,
    /// Clock value of the last access.
    pub last_access: u64,
    /// Bytes freed by evicting it.
    pub bytes: usize,
}

/// A cache whose memory the manager can account for and reclaim.
pub trait ManagedCache: Send + Sync {
    /// Name used in logs.
    fn cache_name(&self) -> String;

    /// Bytes currently held.
    fn used_memory(&self) -> usize;

    /// Blocks that may be evicted (pinned blocks excluded).
    fn eviction_candidates(&self) -> Vec<EvictionCandidate>;

    /// Drop one block, returning the bytes freed.
    fn evict(&self, block: &BlockIndex) -> usize;

    /// Drop everything.
    fn free_all(&self);
}

struct Inner {
    budget: Option<usize>,
    caches: Mutex<Vec<Weak<dyn ManagedCache>>>,
    clock: AtomicU64,
    enforcing: Mutex<()>,
}

/// Shared registry of caches plus the access clock used for LRU ordering.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("budget", &self.inner.budget)
            .field("caches", &self.inner.caches.lock().len())
            .finish()
    }
}

impl MemoryManager {
    /// Create a manager; `None` disables eviction.
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                budget,
                caches: Mutex::new(Vec::new()),
                clock: AtomicU64::new(0),
                enforcing: Mutex::new(()),
            }),
        }
    }

    /// Byte budget.
    pub fn budget(&self) -> Option<usize> {
        self.inner.budget
    }

    /// Track `cache`. The manager holds it weakly.
    pub fn register(&self, cache: Weak<dyn ManagedCache>) {
        let mut caches = self.inner.caches.lock();
        caches.retain(|c| c.strong_count() > 0);
        caches.push(cache);
    }

    /// Advance the access clock and return the new time.
    pub fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn live_caches(&self) -> Vec<Arc<dyn ManagedCache>> {
        self.inner
            .caches
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Bytes held by all live caches.
    pub fn used_memory(&self) -> usize {
        self.live_caches().iter().map(|c| c.used_memory()).sum()
    }

    /// Evict least-recently-used blocks while over budget. Returns the bytes
    /// freed. Concurrent calls collapse into one pass.
    pub fn enforce(&self) -> usize {
        let Some(budget) = self.inner.budget else {
            return 0;
        };
        let Some(_guard) = self.inner.enforcing.try_lock() else {
            return 0;
        };
        let caches = self.live_caches();
        let mut used: usize = caches.iter().map(|c| c.used_memory()).sum();
        if used <= budget {
            return 0;
        }

        let target = (budget as f64 * TARGET_FRACTION) as usize;
        let mut candidates: Vec<(usize, EvictionCandidate)> = caches
            .iter()
            .enumerate()
            .flat_map(|(i, c)| c.eviction_candidates().into_iter().map(move |e| (i, e)))
            .collect();
        candidates.sort_by_key(|(_, e)| e.last_access);

        let mut freed = 0;
        for (i, candidate) in candidates {
            if used <= target {
                break;
            }
            let bytes = caches[i].evict(&candidate.block);
            used = used.saturating_sub(bytes);
            freed += bytes;
        }
        tracing::debug!(
            "cache_evict: freed {freed} bytes, {used} of {budget} bytes in use"
        );
        freed
    }

    /// Drop the data of every cache.
    pub fn free_all(&self) {
        for cache in self.live_caches() {
            cache.free_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Blocks of fixed size keyed by index, with explicit access times.
    struct FakeCache {
        blocks: Mutex<BTreeMap<BlockIndex, (u64, usize)>>,
    }

    impl FakeCache {
        fn new(blocks: &[(usize, u64, usize)]) -> Arc<Self> {
            Arc::new(Self {
                blocks: Mutex::new(
                    blocks
                        .iter()
                        .map(|&(i, t, b)| (vec![i], (t, b)))
                        .collect(),
                ),
            })
        }
    }

    impl ManagedCache for FakeCache {
        fn cache_name(&self) -> String {
            "fake".into()
        }

        fn used_memory(&self) -> usize {
            self.blocks.lock().values().map(|(_, b)| b).sum()
        }

        fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
            self.blocks
                .lock()
                .iter()
                .map(|(k, &(t, b))| EvictionCandidate {
                    block: k.clone(),
                    last_access: t,
                    bytes: b,
                })
                .collect()
        }

        fn evict(&self, block: &BlockIndex) -> usize {
            self.blocks.lock().remove(block).map_or(0, |(_, b)| b)
        }

        fn free_all(&self) {
            self.blocks.lock().clear();
        }
    }

    fn register(manager: &MemoryManager, cache: &Arc<FakeCache>) {
        let cache: Arc<dyn ManagedCache> = cache.clone();
        manager.register(Arc::downgrade(&cache));
    }

    #[test]
    fn under_budget_evicts_nothing() {
        let manager = MemoryManager::new(Some(1000));
        let cache = FakeCache::new(&[(0, 1, 400), (1, 2, 400)]);
        register(&manager, &cache);
        assert_eq!(manager.enforce(), 0);
        assert_eq!(manager.used_memory(), 800);
    }

    #[test]
    fn evicts_oldest_across_caches_down_to_target() {
        let manager = MemoryManager::new(Some(1000));
        let a = FakeCache::new(&[(0, 5, 300), (1, 1, 300)]);
        let b = FakeCache::new(&[(0, 2, 300), (1, 9, 300)]);
        register(&manager, &a);
        register(&manager, &b);
        // 1200 used, target 800: the two oldest blocks go.
        assert_eq!(manager.enforce(), 600);
        assert_eq!(a.blocks.lock().keys().cloned().collect::<Vec<_>>(), vec![vec![0]]);
        assert_eq!(b.blocks.lock().keys().cloned().collect::<Vec<_>>(), vec![vec![1]]);
    }

    #[test]
    fn no_budget_never_evicts() {
        let manager = MemoryManager::new(None);
        let cache = FakeCache::new(&[(0, 1, usize::MAX / 4)]);
        register(&manager, &cache);
        assert_eq!(manager.enforce(), 0);
    }

    #[test]
    fn dropped_caches_are_forgotten() {
        let manager = MemoryManager::new(Some(10));
        {
            let cache = FakeCache::new(&[(0, 1, 100)]);
            register(&manager, &cache);
        }
        assert_eq!(manager.used_memory(), 0);
    }

    #[test]
    fn clock_is_monotonic() {
        let manager = MemoryManager::new(None);
        let a = manager.tick();
        let b = manager.tick();
        assert!(b > a);
    }
}
