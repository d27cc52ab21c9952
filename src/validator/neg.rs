//! Aggressive negative cache for DS denials.
//!
//! When a validated NSEC or NSEC3 proof shows that a zone cut has no DS
//! record, that fact is cached here. The key-chase consults this cache
//! before dispatching a DS sub-query and synthesizes the proved-insecure
//! outcome on a hit, saving a round trip per insecure delegation.

use hickory_proto::rr::Name;

use crate::cache::slab::{MemSize, SlabCache};

#[derive(Clone, Debug)]
struct NegEntry {
    expire: u64,
}

impl MemSize for NegEntry {
    fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + 64
    }
}

/// Cache of zones proved to have no DS record.
pub struct NegCache {
    table: SlabCache<Name, NegEntry>,
}

fn name_hash(name: &Name) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

impl NegCache {
    pub fn new(max_mem: usize) -> Self {
        Self {
            table: SlabCache::new(4, max_mem),
        }
    }

    /// Record a validated no-DS proof for a zone cut.
    pub fn store_no_ds(&self, zone: Name, expire: u64) {
        let hash = name_hash(&zone);
        self.table.insert(hash, zone, NegEntry { expire });
    }

    /// Whether a live no-DS proof exists for this zone cut.
    pub fn proves_no_ds(&self, zone: &Name, now: u64) -> bool {
        match self.table.lookup(name_hash(zone), zone) {
            Some(entry) => entry.read().expire > now,
            None => false,
        }
    }

    pub fn clear(&self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn stored_proof_expires() {
        let cache = NegCache::new(1 << 16);
        let zone = Name::from_str("unsigned.example.").unwrap();
        cache.store_no_ds(zone.clone(), 500);
        assert!(cache.proves_no_ds(&zone, 499));
        assert!(!cache.proves_no_ds(&zone, 500));
        assert!(!cache.proves_no_ds(&Name::from_str("other.example.").unwrap(), 100));
    }
}
