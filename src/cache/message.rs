//! Full-reply storage above the slab cache.
//!
//! A stored reply does not own its RRsets. They are written through to the
//! RRset cache and the message entry keeps `(key, version id)` references.
//! On lookup every reference is re-resolved and checked against the captured
//! id; a single evicted, replaced or expired RRset turns the whole entry
//! into a miss, so a reply handed out never contains stale sets.

use hickory_proto::{dnssec::Proof, op::ResponseCode};

use crate::cache::rrset::RrsetCache;
use crate::cache::slab::{MemSize, SlabCache};
use crate::reply::{PackedRrset, QueryInfo, Reply, RrsetKey};

/// Back-reference to an RRset captured at store time.
#[derive(Clone, Debug)]
pub struct RrsetRef {
    pub key: RrsetKey,
    pub id_at_capture: u64,
}

/// A cached reply: header bits, section shape and RRset references.
#[derive(Clone, Debug)]
pub struct MessageEntry {
    pub rcode: ResponseCode,
    pub authoritative: bool,
    pub security: Proof,
    /// Absolute expiry; the minimum over the referenced sets at store time
    pub expire: u64,
    /// When the entry was stored, for the prefetch window computation
    pub stored_at: u64,
    an_count: usize,
    ns_count: usize,
    refs: Vec<RrsetRef>,
}

impl MemSize for MessageEntry {
    fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.refs.len() * (std::mem::size_of::<RrsetRef>() + 24)
    }
}

/// Result of a message cache lookup.
pub struct CachedReply {
    pub reply: Reply,
    /// True when the entry is inside the last tenth of its lifetime and a
    /// background refresh is worth scheduling.
    pub wants_prefetch: bool,
}

/// Shared cache of complete replies, keyed by the query-info fingerprint.
pub struct MessageCache {
    table: SlabCache<QueryInfo, MessageEntry>,
}

impl MessageCache {
    pub fn new(slabs: usize, max_mem: usize) -> Self {
        Self {
            table: SlabCache::new(slabs, max_mem),
        }
    }

    /// Store a reply. RRsets are written through to the RRset cache first;
    /// the entry references whatever the RRset cache kept (which may be a
    /// pre-existing dominant set rather than the input).
    ///
    /// `expire_override` pins the entry lifetime regardless of RRset TTLs;
    /// it is how bogus replies get their fixed re-validation interval.
    pub fn store(
        &self,
        qinfo: &QueryInfo,
        reply: &Reply,
        rrset_cache: &RrsetCache,
        now: u64,
        expire_override: Option<u64>,
    ) {
        let mut refs = Vec::with_capacity(
            reply.answer.len() + reply.authority.len() + reply.additional.len(),
        );
        let mut min_expire = u64::MAX;

        let mut store_section = |section: &[PackedRrset]| {
            for rrset in section {
                let stored = rrset_cache.update(rrset.clone(), now);
                min_expire = min_expire.min(stored.expire);
                refs.push(RrsetRef {
                    key: stored.key(),
                    id_at_capture: stored.id,
                });
            }
        };
        store_section(&reply.answer);
        store_section(&reply.authority);
        store_section(&reply.additional);

        let expire = match expire_override {
            Some(expire) => expire,
            None if refs.is_empty() => now,
            None => min_expire,
        };
        if expire <= now {
            // nothing worth keeping; negative replies without SOA land here
            return;
        }

        let entry = MessageEntry {
            rcode: reply.rcode,
            authoritative: reply.authoritative,
            security: reply.security,
            expire,
            stored_at: now,
            an_count: reply.answer.len(),
            ns_count: reply.authority.len(),
            refs,
        };
        self.table.insert(qinfo.hash_value(), qinfo.clone(), entry);
    }

    /// Look up a reply. Expired entries, and entries whose back-references
    /// no longer resolve to the captured RRset versions, are misses.
    pub fn lookup(
        &self,
        qinfo: &QueryInfo,
        rrset_cache: &RrsetCache,
        now: u64,
    ) -> Option<CachedReply> {
        let entry = self.table.lookup(qinfo.hash_value(), qinfo)?;
        let entry = entry.read().clone();
        if entry.expire <= now {
            return None;
        }

        let mut rrsets = Vec::with_capacity(entry.refs.len());
        for rref in &entry.refs {
            let live = rrset_cache.lookup(
                &rref.key.name,
                rref.key.rtype,
                rref.key.class,
                rref.key.flags,
                now,
            )?;
            let live = live.read();
            if live.id != rref.id_at_capture || live.is_expired(now) {
                return None;
            }
            rrsets.push(live.clone());
        }

        let mut iter = rrsets.into_iter();
        let reply = Reply {
            rcode: entry.rcode,
            authoritative: entry.authoritative,
            security: entry.security,
            answer: iter.by_ref().take(entry.an_count).collect(),
            authority: iter.by_ref().take(entry.ns_count).collect(),
            additional: iter.collect(),
        };

        // prefetch window: the final tenth of the entry's lifetime
        let remaining = entry.expire.saturating_sub(now);
        let lifetime = entry.expire.saturating_sub(entry.stored_at);
        let wants_prefetch = lifetime > 0 && remaining * 10 <= lifetime;

        Some(CachedReply {
            reply,
            wants_prefetch,
        })
    }

    /// Update the security status and lifetime of an existing entry.
    pub fn set_security(&self, qinfo: &QueryInfo, security: Proof, expire: u64) {
        if let Some(entry) = self.table.lookup(qinfo.hash_value(), qinfo) {
            let mut guard = entry.write();
            guard.security = security;
            guard.expire = expire;
        }
    }

    pub fn remove(&self, qinfo: &QueryInfo) {
        self.table.remove(qinfo.hash_value(), qinfo);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::TrustLevel;
    use hickory_proto::rr::{rdata::A, DNSClass, Name, RData, RecordType};
    use std::str::FromStr;

    fn caches() -> (MessageCache, RrsetCache) {
        (MessageCache::new(4, 1 << 20), RrsetCache::new(4, 1 << 20))
    }

    fn a_reply(name: &str, expire: u64) -> (QueryInfo, Reply) {
        let name = Name::from_str(name).unwrap();
        let qinfo = QueryInfo::new(name.clone(), RecordType::A);
        let mut reply = Reply::empty(ResponseCode::NoError);
        reply.authoritative = true;
        reply.answer.push(PackedRrset {
            name,
            rtype: RecordType::A,
            class: DNSClass::IN,
            flags: 0,
            expire,
            rdatas: vec![RData::A(A::new(192, 0, 2, 7))],
            rrsigs: Vec::new(),
            trust: TrustLevel::AnswerAa,
            security: Proof::Indeterminate,
            id: 0,
        });
        (qinfo, reply)
    }

    #[test]
    fn store_then_lookup_roundtrips() {
        let (messages, rrsets) = caches();
        let (qinfo, reply) = a_reply("www.example.com.", 1_000);
        messages.store(&qinfo, &reply, &rrsets, 100, None);
        let hit = messages.lookup(&qinfo, &rrsets, 200).unwrap();
        assert_eq!(hit.reply.answer.len(), 1);
        assert_eq!(hit.reply.answer[0].ttl(200), 800);
        assert!(!hit.wants_prefetch);
    }

    #[test]
    fn storing_twice_is_idempotent() {
        let (messages, rrsets) = caches();
        let (qinfo, reply) = a_reply("www.example.com.", 1_000);
        messages.store(&qinfo, &reply, &rrsets, 100, None);
        let first = messages.lookup(&qinfo, &rrsets, 100).unwrap();
        messages.store(&qinfo, &reply, &rrsets, 100, None);
        let second = messages.lookup(&qinfo, &rrsets, 100).unwrap();
        assert_eq!(
            first.reply.answer[0].id,
            second.reply.answer[0].id,
            "re-storing identical data must not churn version ids"
        );
    }

    #[test]
    fn replaced_rrset_invalidates_message() {
        let (messages, rrsets) = caches();
        let (qinfo, reply) = a_reply("www.example.com.", 1_000);
        messages.store(&qinfo, &reply, &rrsets, 100, None);

        // a fresher answer for the same owner/type replaces the set
        let (_, newer) = a_reply("www.example.com.", 5_000);
        rrsets.update(newer.answer[0].clone(), 100);

        assert!(
            messages.lookup(&qinfo, &rrsets, 200).is_none(),
            "captured version id no longer matches"
        );
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let (messages, rrsets) = caches();
        let (qinfo, reply) = a_reply("www.example.com.", 1_000);
        messages.store(&qinfo, &reply, &rrsets, 100, None);
        assert!(messages.lookup(&qinfo, &rrsets, 1_000).is_none());
    }

    #[test]
    fn prefetch_window_opens_near_expiry() {
        let (messages, rrsets) = caches();
        let (qinfo, reply) = a_reply("www.example.com.", 1_100);
        messages.store(&qinfo, &reply, &rrsets, 100, None);
        // lifetime 1000s; at 950s remaining it is not in the window
        assert!(!messages.lookup(&qinfo, &rrsets, 150).unwrap().wants_prefetch);
        // with 50s remaining out of 1000 it is
        assert!(messages.lookup(&qinfo, &rrsets, 1_050).unwrap().wants_prefetch);
    }

    #[test]
    fn expire_override_pins_lifetime() {
        let (messages, rrsets) = caches();
        let (qinfo, mut reply) = a_reply("bad.example.com.", 5_000);
        reply.security = Proof::Bogus;
        messages.store(&qinfo, &reply, &rrsets, 100, Some(160));
        assert_eq!(
            messages.lookup(&qinfo, &rrsets, 150).unwrap().reply.security,
            Proof::Bogus
        );
        assert!(messages.lookup(&qinfo, &rrsets, 161).is_none());
    }
}
