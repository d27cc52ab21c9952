//! Validated key storage.
//!
//! A key entry is the outcome of chasing the trust chain to a zone: the
//! validated DNSKEY set, a proved-insecure marker, or a null marker left by
//! a failed prime so the chase is not retried before its TTL runs out.

use hickory_proto::rr::{DNSClass, Name};

use crate::cache::slab::{MemSize, SlabCache};
use crate::reply::PackedRrset;

/// TTL for a key entry left behind by a failed trust anchor prime.
pub const NULL_KEY_TTL: u64 = 900;

#[derive(Clone, Debug)]
pub enum KeyEntryKind {
    /// The validated DNSKEY RRset for the zone
    Good(PackedRrset),
    /// The zone is proved insecure (no DS at the delegation)
    Insecure,
    /// Priming failed; do not retry until the entry expires
    Null,
}

/// A cached trust-chain outcome for one zone.
#[derive(Clone, Debug)]
pub struct KeyEntry {
    pub name: Name,
    pub class: DNSClass,
    pub kind: KeyEntryKind,
    /// Absolute expiry, seconds
    pub expire: u64,
}

impl KeyEntry {
    pub fn good(dnskeys: PackedRrset, expire: u64) -> Self {
        Self {
            name: dnskeys.name.clone(),
            class: dnskeys.class,
            kind: KeyEntryKind::Good(dnskeys),
            expire,
        }
    }

    pub fn insecure(name: Name, class: DNSClass, expire: u64) -> Self {
        Self {
            name,
            class,
            kind: KeyEntryKind::Insecure,
            expire,
        }
    }

    pub fn null(name: Name, class: DNSClass, now: u64) -> Self {
        Self {
            name,
            class,
            kind: KeyEntryKind::Null,
            expire: now + NULL_KEY_TTL,
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self.kind, KeyEntryKind::Good(_))
    }

    pub fn is_insecure(&self) -> bool {
        matches!(self.kind, KeyEntryKind::Insecure)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, KeyEntryKind::Null)
    }

    pub fn dnskeys(&self) -> Option<&PackedRrset> {
        match &self.kind {
            KeyEntryKind::Good(rrset) => Some(rrset),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expire <= now
    }
}

impl MemSize for KeyEntry {
    fn mem_size(&self) -> usize {
        let base = std::mem::size_of::<Self>() + self.name.len();
        match &self.kind {
            KeyEntryKind::Good(rrset) => base + rrset.mem_size(),
            _ => base,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct KeyName {
    name: Name,
    class: DNSClass,
}

impl KeyName {
    fn hash_value(&self) -> u32 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

/// Shared cache of key entries, one per (zone, class).
pub struct KeyCache {
    table: SlabCache<KeyName, KeyEntry>,
}

impl KeyCache {
    pub fn new(slabs: usize, max_mem: usize) -> Self {
        Self {
            table: SlabCache::new(slabs, max_mem),
        }
    }

    pub fn store(&self, entry: KeyEntry) {
        let key = KeyName {
            name: entry.name.clone(),
            class: entry.class,
        };
        self.table.insert(key.hash_value(), key, entry);
    }

    pub fn lookup(&self, name: &Name, class: DNSClass, now: u64) -> Option<KeyEntry> {
        let key = KeyName {
            name: name.clone(),
            class,
        };
        let entry = self.table.lookup(key.hash_value(), &key)?;
        let entry = entry.read().clone();
        if entry.is_expired(now) {
            return None;
        }
        Some(entry)
    }

    /// The deepest cached key entry at or above `name`; used to shortcut
    /// the walk down from a trust anchor.
    pub fn closest(&self, name: &Name, class: DNSClass, now: u64) -> Option<KeyEntry> {
        let mut current = name.clone();
        loop {
            if let Some(entry) = self.lookup(&current, class, now) {
                return Some(entry);
            }
            if current.is_root() {
                return None;
            }
            current = current.base_name();
        }
    }

    pub fn remove(&self, name: &Name, class: DNSClass) {
        let key = KeyName {
            name: name.clone(),
            class,
        };
        self.table.remove(key.hash_value(), &key);
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
    fn null_entry_expires_after_fixed_ttl() {
        let cache = KeyCache::new(4, 1 << 20);
        let name = Name::from_str("example.com.").unwrap();
        cache.store(KeyEntry::null(name.clone(), DNSClass::IN, 100));
        assert!(cache.lookup(&name, DNSClass::IN, 100).unwrap().is_null());
        assert!(cache.lookup(&name, DNSClass::IN, 100 + NULL_KEY_TTL).is_none());
    }

    #[test]
    fn closest_walks_to_ancestors() {
        let cache = KeyCache::new(4, 1 << 20);
        let com = Name::from_str("com.").unwrap();
        cache.store(KeyEntry::insecure(com.clone(), DNSClass::IN, 1_000));
        let entry = cache
            .closest(&Name::from_str("www.example.com.").unwrap(), DNSClass::IN, 10)
            .unwrap();
        assert_eq!(entry.name, com);
        assert!(entry.is_insecure());
    }
}
