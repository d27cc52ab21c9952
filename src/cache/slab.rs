//! A hash table made of several smaller LRU tables ("slabs").
//!
//! The slab count is fixed at creation (rounded up to a power of two); the
//! top bits of the 32-bit key hash select a slab. Each slab has its own lock
//! and its own LRU order, so the table never needs a global lock and entries
//! never migrate between slabs.
//!
//! Entries are handed out as `Arc<RwLock<V>>` clones. A lookup holds the
//! slab lock only long enough to find and touch the entry; the caller then
//! takes the entry's own read or write lock with the slab lock released.
//! Reference counting keeps a value alive for as long as any caller still
//! holds it, even if the slab evicts the key in the meantime.

use std::hash::Hash;
use std::sync::Arc;

use lru_cache::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// A shared, locked cache entry.
pub type Entry<V> = Arc<RwLock<V>>;

/// Values stored in a [`SlabCache`] report their own memory footprint.
pub trait MemSize {
    /// Approximate heap footprint in bytes, used for the byte budget.
    fn mem_size(&self) -> usize;
}

/// Sharded LRU hash table with a per-slab byte budget.
pub struct SlabCache<K: Eq + Hash, V> {
    slabs: Box<[Slab<K, V>]>,
    shift: u32,
}

struct Slab<K: Eq + Hash, V> {
    inner: Mutex<SlabInner<K, V>>,
    max_mem: usize,
}

struct SlabInner<K: Eq + Hash, V> {
    table: LruCache<K, Entry<V>>,
    mem: usize,
}

impl<K, V> SlabCache<K, V>
where
    K: Eq + Hash + Clone,
    V: MemSize,
{
    /// Create a table of `slabs` LRU tables sharing `max_mem` bytes.
    ///
    /// The slab count is rounded up to a power of two; every slab enforces
    /// an equal share of the byte budget independently.
    pub fn new(slabs: usize, max_mem: usize) -> Self {
        let count = slabs.max(1).next_power_of_two();
        let per_slab = (max_mem / count).max(1);
        let slabs = (0..count)
            .map(|_| Slab {
                inner: Mutex::new(SlabInner {
                    table: LruCache::new(usize::MAX),
                    mem: 0,
                }),
                max_mem: per_slab,
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slabs,
            shift: 32 - count.trailing_zeros(),
        }
    }

    fn slab(&self, hash: u32) -> &Slab<K, V> {
        let index = if self.shift == 32 {
            0
        } else {
            (hash >> self.shift) as usize
        };
        &self.slabs[index]
    }

    /// Look up an entry, touching its LRU position on hit.
    ///
    /// The returned entry is a shared handle; take its read or write lock as
    /// needed. Whether it is still the live entry for the key can be checked
    /// by re-reading, which the typed caches do with version ids.
    pub fn lookup(&self, hash: u32, key: &K) -> Option<Entry<V>> {
        let slab = self.slab(hash);
        let mut inner = slab.inner.lock();
        inner.table.get_mut(key).as_deref().map(Arc::clone)
    }

    /// Insert a value, replacing any existing entry for the key in place.
    ///
    /// In-place replacement means callers already holding the old entry
    /// observe the new data on their next lock acquisition. After the
    /// insertion the slab evicts from the cold end of its LRU until it is
    /// back under its byte budget. A value too large for the whole slab is
    /// dropped silently; the cache degrades to a miss for that key.
    pub fn insert(&self, hash: u32, key: K, value: V) -> Option<Entry<V>> {
        let size = value.mem_size();
        let slab = self.slab(hash);
        if size > slab.max_mem {
            debug!("cache entry of {size} bytes exceeds slab budget, not stored");
            return None;
        }

        let mut inner = slab.inner.lock();
        let entry = if let Some(existing) = inner.table.get_mut(&key).as_deref().map(Arc::clone) {
            let old_size = {
                let mut guard = existing.write();
                let old = guard.mem_size();
                *guard = value;
                old
            };
            inner.mem = inner.mem.saturating_sub(old_size) + size;
            existing
        } else {
            let entry = Arc::new(RwLock::new(value));
            inner.table.insert(key, Arc::clone(&entry));
            inner.mem += size;
            entry
        };

        while inner.mem > slab.max_mem {
            match inner.table.remove_lru() {
                Some((_, evicted)) => {
                    inner.mem = inner.mem.saturating_sub(evicted.read().mem_size());
                }
                None => break,
            }
        }
        Some(entry)
    }

    /// Remove the entry for a key, if present.
    pub fn remove(&self, hash: u32, key: &K) {
        let slab = self.slab(hash);
        let mut inner = slab.inner.lock();
        if let Some(entry) = inner.table.remove(key) {
            inner.mem = inner.mem.saturating_sub(entry.read().mem_size());
        }
    }

    /// Re-account an entry whose value was mutated in place from `old` to
    /// `new` bytes, evicting cold entries if the slab went over budget.
    pub fn account(&self, hash: u32, old: usize, new: usize) {
        let slab = self.slab(hash);
        let mut inner = slab.inner.lock();
        inner.mem = inner.mem.saturating_sub(old) + new;
        while inner.mem > slab.max_mem {
            match inner.table.remove_lru() {
                Some((_, evicted)) => {
                    inner.mem = inner.mem.saturating_sub(evicted.read().mem_size());
                }
                None => break,
            }
        }
    }

    /// Drop every entry in every slab.
    pub fn clear(&self) {
        for slab in self.slabs.iter() {
            let mut inner = slab.inner.lock();
            inner.table.clear();
            inner.mem = 0;
        }
    }

    /// Number of entries across all slabs.
    pub fn len(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.inner.lock().table.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes accounted across all slabs.
    pub fn mem_used(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.inner.lock().mem)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Blob(Vec<u8>);

    impl MemSize for Blob {
        fn mem_size(&self) -> usize {
            self.0.len()
        }
    }

    #[test]
    fn lookup_returns_inserted_value() {
        let cache = SlabCache::<u32, Blob>::new(4, 4096);
        cache.insert(7, 7, Blob(vec![1; 16]));
        let entry = cache.lookup(7, &7).unwrap();
        assert_eq!(entry.read().0.len(), 16);
        assert!(cache.lookup(7, &8).is_none());
    }

    #[test]
    fn insert_replaces_in_place() {
        let cache = SlabCache::<u32, Blob>::new(1, 4096);
        cache.insert(1, 1, Blob(vec![1; 8]));
        let held = cache.lookup(1, &1).unwrap();
        cache.insert(1, 1, Blob(vec![2; 8]));
        // the handle taken before the replacement observes the new data
        assert_eq!(held.read().0[0], 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lru_evicts_cold_entries_when_over_budget() {
        // one slab, room for two 100-byte blobs
        let cache = SlabCache::<u32, Blob>::new(1, 200);
        cache.insert(1, 1, Blob(vec![0; 100]));
        cache.insert(2, 2, Blob(vec![0; 100]));
        // touch 1 so that 2 is the coldest
        assert!(cache.lookup(1, &1).is_some());
        cache.insert(3, 3, Blob(vec![0; 100]));
        assert!(cache.lookup(2, &2).is_none());
        assert!(cache.lookup(1, &1).is_some());
        assert!(cache.lookup(3, &3).is_some());
    }

    #[test]
    fn oversized_value_is_dropped_silently() {
        let cache = SlabCache::<u32, Blob>::new(1, 64);
        assert!(cache.insert(1, 1, Blob(vec![0; 128])).is_none());
        assert!(cache.lookup(1, &1).is_none());
    }

    #[test]
    fn evicted_entry_stays_alive_while_held() {
        let cache = SlabCache::<u32, Blob>::new(1, 100);
        cache.insert(1, 1, Blob(vec![7; 80]));
        let held = cache.lookup(1, &1).unwrap();
        cache.insert(2, 2, Blob(vec![0; 80]));
        assert!(cache.lookup(1, &1).is_none());
        // the reference still reads the original data
        assert_eq!(held.read().0[0], 7);
    }

    #[test]
    fn remove_deletes_entry() {
        let cache = SlabCache::<u32, Blob>::new(2, 4096);
        cache.insert(9, 9, Blob(vec![0; 10]));
        cache.remove(9, &9);
        assert!(cache.lookup(9, &9).is_none());
        assert_eq!(cache.mem_used(), 0);
    }
}
