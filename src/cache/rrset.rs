//! Typed RRset storage above the slab cache.
//!
//! Every stored RRset carries a trust level and a version id. Updates only
//! replace an existing entry when the incoming data dominates it, and every
//! replacement bumps the version id so that message-cache back-references
//! can detect that the set they captured is gone.

use std::sync::atomic::{AtomicU64, Ordering};

use hickory_proto::rr::{DNSClass, Name, RecordType};

use crate::cache::slab::{Entry, MemSize, SlabCache};
use crate::reply::{PackedRrset, RrsetKey, TrustLevel};

impl MemSize for PackedRrset {
    fn mem_size(&self) -> usize {
        PackedRrset::mem_size(self)
    }
}

/// Shared cache of canonical RRsets.
pub struct RrsetCache {
    table: SlabCache<RrsetKey, PackedRrset>,
    next_id: AtomicU64,
}

impl RrsetCache {
    pub fn new(slabs: usize, max_mem: usize) -> Self {
        Self {
            table: SlabCache::new(slabs, max_mem),
            next_id: AtomicU64::new(1),
        }
    }

    /// Look up a live (unexpired) RRset.
    pub fn lookup(
        &self,
        name: &Name,
        rtype: RecordType,
        class: DNSClass,
        flags: u8,
        now: u64,
    ) -> Option<Entry<PackedRrset>> {
        let key = RrsetKey {
            name: name.clone(),
            rtype,
            class,
            flags,
        };
        let entry = self.table.lookup(key.hash_value(), &key)?;
        if entry.read().is_expired(now) {
            return None;
        }
        Some(entry)
    }

    /// Fetch a copy of a live RRset.
    pub fn get(
        &self,
        name: &Name,
        rtype: RecordType,
        class: DNSClass,
        flags: u8,
        now: u64,
    ) -> Option<PackedRrset> {
        self.lookup(name, rtype, class, flags, now)
            .map(|entry| entry.read().clone())
    }

    /// Store an RRset, keeping whichever of (existing, incoming) dominates.
    ///
    /// The incoming set wins if it has strictly higher trust, or equal trust
    /// and signatures where the existing set has none, or equal trust and a
    /// later expiry. The returned value is the RRset that is actually in the
    /// cache afterwards; callers must use it in place of their input.
    pub fn update(&self, mut rrset: PackedRrset, now: u64) -> PackedRrset {
        let key = rrset.key();
        let hash = key.hash_value();

        if let Some(existing) = self.table.lookup(hash, &key) {
            let current = existing.read().clone();
            if !current.is_expired(now) && !dominates(&rrset, &current) {
                return current;
            }
        }

        rrset.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.table.insert(hash, key, rrset.clone()) {
            Some(entry) => entry.read().clone(),
            // too large for the slab budget; hand the caller its own copy
            None => rrset,
        }
    }

    /// Raise the security status of a cached RRset to `Validated` trust.
    ///
    /// The set is matched by version id so a concurrent replacement is never
    /// upgraded by accident. This is the only in-place mutation the cache
    /// performs besides replacement.
    pub fn upgrade_security(
        &self,
        key: &RrsetKey,
        id: u64,
        security: hickory_proto::dnssec::Proof,
    ) {
        let hash = key.hash_value();
        if let Some(entry) = self.table.lookup(hash, key) {
            let mut guard = entry.write();
            if guard.id == id && guard.security < security {
                guard.security = security;
                guard.trust = TrustLevel::Validated;
            }
        }
    }

    pub fn remove(&self, key: &RrsetKey) {
        self.table.remove(key.hash_value(), key);
    }

    pub fn clear(&self) {
        self.table.clear();
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Whether `incoming` should replace `current`.
fn dominates(incoming: &PackedRrset, current: &PackedRrset) -> bool {
    if incoming.trust != current.trust {
        return incoming.trust > current.trust;
    }
    if !incoming.rrsigs.is_empty() && current.rrsigs.is_empty() {
        return true;
    }
    if incoming.rrsigs.is_empty() && !current.rrsigs.is_empty() {
        return false;
    }
    incoming.expire > current.expire
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::dnssec::Proof;
    use hickory_proto::rr::{rdata::A, RData};
    use std::str::FromStr;

    fn rrset(name: &str, expire: u64, trust: TrustLevel) -> PackedRrset {
        PackedRrset {
            name: Name::from_str(name).unwrap(),
            rtype: RecordType::A,
            class: DNSClass::IN,
            flags: 0,
            expire,
            rdatas: vec![RData::A(A::new(192, 0, 2, 1))],
            rrsigs: Vec::new(),
            trust,
            security: Proof::Indeterminate,
            id: 0,
        }
    }

    #[test]
    fn update_inserts_and_assigns_id() {
        let cache = RrsetCache::new(4, 1 << 20);
        let stored = cache.update(rrset("www.example.com.", 1_000, TrustLevel::AnswerAa), 100);
        assert!(stored.id > 0);
        let found = cache
            .get(
                &Name::from_str("www.example.com.").unwrap(),
                RecordType::A,
                DNSClass::IN,
                0,
                100,
            )
            .unwrap();
        assert_eq!(found.id, stored.id);
    }

    #[test]
    fn lower_trust_does_not_replace() {
        let cache = RrsetCache::new(4, 1 << 20);
        let answer = cache.update(rrset("a.example.com.", 1_000, TrustLevel::AnswerAa), 100);
        let kept = cache.update(rrset("a.example.com.", 2_000, TrustLevel::AdditionalAddr), 100);
        assert_eq!(kept.id, answer.id);
        assert_eq!(kept.trust, TrustLevel::AnswerAa);
    }

    #[test]
    fn equal_trust_later_expiry_replaces_and_bumps_id() {
        let cache = RrsetCache::new(4, 1 << 20);
        let first = cache.update(rrset("a.example.com.", 1_000, TrustLevel::AnswerAa), 100);
        let second = cache.update(rrset("a.example.com.", 2_000, TrustLevel::AnswerAa), 100);
        assert!(second.id > first.id);
        assert_eq!(second.expire, 2_000);
    }

    #[test]
    fn expired_entry_is_replaced_regardless_of_trust() {
        let cache = RrsetCache::new(4, 1 << 20);
        cache.update(rrset("a.example.com.", 150, TrustLevel::Validated), 100);
        // at now=200 the validated entry is expired; authority data may land
        let stored = cache.update(rrset("a.example.com.", 500, TrustLevel::Authority), 200);
        assert_eq!(stored.trust, TrustLevel::Authority);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = RrsetCache::new(4, 1 << 20);
        cache.update(rrset("a.example.com.", 150, TrustLevel::AnswerAa), 100);
        assert!(cache
            .get(
                &Name::from_str("a.example.com.").unwrap(),
                RecordType::A,
                DNSClass::IN,
                0,
                151,
            )
            .is_none());
    }

    #[test]
    fn upgrade_security_checks_version() {
        let cache = RrsetCache::new(4, 1 << 20);
        let stored = cache.update(rrset("a.example.com.", 1_000, TrustLevel::AnswerAa), 100);
        let key = stored.key();
        cache.upgrade_security(&key, stored.id + 1, Proof::Secure);
        assert_eq!(
            cache
                .get(&key.name, key.rtype, key.class, key.flags, 100)
                .unwrap()
                .security,
            Proof::Indeterminate
        );
        cache.upgrade_security(&key, stored.id, Proof::Secure);
        let upgraded = cache
            .get(&key.name, key.rtype, key.class, key.flags, 100)
            .unwrap();
        assert_eq!(upgraded.security, Proof::Secure);
        assert_eq!(upgraded.trust, TrustLevel::Validated);
    }
}
