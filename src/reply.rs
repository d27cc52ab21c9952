//! The compact reply representation threaded through the resolver core.
//!
//! Wire messages are unpacked into [`Reply`] values: per-section lists of
//! [`PackedRrset`]s, each carrying its RRSIGs, a trust level derived from the
//! section it was found in, and a security status assigned by validation.
//! The caches store these, not raw messages.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use hickory_proto::{
    dnssec::{rdata::RRSIG, Proof},
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{DNSClass, Name, RData, Record, RecordType},
};

/// The (qname, qtype, qclass) tuple that keys a resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryInfo {
    /// Owner name being queried, in canonical (lowercased) form
    pub qname: Name,
    /// Query type
    pub qtype: RecordType,
    /// Query class, almost always IN
    pub qclass: DNSClass,
}

impl QueryInfo {
    pub fn new(qname: Name, qtype: RecordType) -> Self {
        Self {
            qname,
            qtype,
            qclass: DNSClass::IN,
        }
    }

    pub fn from_query(query: &Query) -> Self {
        Self {
            qname: query.name().clone(),
            qtype: query.query_type(),
            qclass: query.query_class(),
        }
    }

    pub fn to_query(&self) -> Query {
        let mut query = Query::query(self.qname.clone(), self.qtype);
        query.set_query_class(self.qclass);
        query
    }

    /// 32-bit hash used to pick a cache slab. Name hashing is case folded.
    pub fn hash_value(&self) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

impl std::fmt::Display for QueryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.qname, self.qclass, self.qtype)
    }
}

/// How believable an RRset is, by where it was found. Ascending order.
///
/// An update to the RRset cache only replaces an existing entry if the new
/// data carries a higher level, or the same level with a longer life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrustLevel {
    /// Non-address record from the additional section
    AdditionalNoAddr,
    /// Address record from the additional section (glue)
    AdditionalAddr,
    /// Record from the authority section
    Authority,
    /// Record from the answer section of an authoritative reply
    AnswerAa,
    /// Record that passed DNSSEC validation
    Validated,
}

/// RRset flag bit: NSEC record that sits at a zone apex.
pub const RRSET_NSEC_AT_APEX: u8 = 0x01;

/// Key of an RRset cache entry: (owner, type, class, flags).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RrsetKey {
    pub name: Name,
    pub rtype: RecordType,
    pub class: DNSClass,
    pub flags: u8,
}

impl RrsetKey {
    pub fn hash_value(&self) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

/// An RRset in compact form: owner, type, class, flags, the rdata list and
/// the covering RRSIGs, plus cache metadata.
///
/// The expiry is kept in absolute wall-clock seconds; only on export to a
/// wire message is it turned back into a relative TTL. `id` is a version
/// number bumped by the RRset cache on every replacement so that held
/// references can be detected as stale.
#[derive(Clone, Debug)]
pub struct PackedRrset {
    pub name: Name,
    pub rtype: RecordType,
    pub class: DNSClass,
    pub flags: u8,
    /// Absolute expiry, seconds since the epoch
    pub expire: u64,
    pub rdatas: Vec<RData>,
    pub rrsigs: Vec<RRSIG>,
    pub trust: TrustLevel,
    pub security: Proof,
    /// Version id assigned by the RRset cache; 0 before first insertion
    pub id: u64,
}

impl PackedRrset {
    pub fn key(&self) -> RrsetKey {
        RrsetKey {
            name: self.name.clone(),
            rtype: self.rtype,
            class: self.class,
            flags: self.flags,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expire <= now
    }

    /// Remaining lifetime in seconds, zero when expired.
    pub fn ttl(&self, now: u64) -> u32 {
        self.expire.saturating_sub(now).min(u32::MAX as u64) as u32
    }

    /// Expand back into wire records with TTLs relative to `now`.
    pub fn to_records(&self, now: u64) -> Vec<Record> {
        let ttl = self.ttl(now);
        self.rdatas
            .iter()
            .map(|rdata| Record::from_rdata(self.name.clone(), ttl, rdata.clone()))
            .collect()
    }

    /// Rough memory footprint, used for the cache byte budget.
    pub fn mem_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        size += self.name.len();
        for rdata in &self.rdatas {
            size += std::mem::size_of_val(rdata);
        }
        for rrsig in &self.rrsigs {
            size += std::mem::size_of_val(rrsig) + rrsig.sig().len();
        }
        size
    }
}

/// A decoded reply: the answer/authority/additional RRsets with the header
/// bits the resolver cares about.
#[derive(Clone, Debug)]
pub struct Reply {
    pub rcode: ResponseCode,
    pub authoritative: bool,
    pub security: Proof,
    pub answer: Vec<PackedRrset>,
    pub authority: Vec<PackedRrset>,
    pub additional: Vec<PackedRrset>,
}

impl Reply {
    pub fn empty(rcode: ResponseCode) -> Self {
        Self {
            rcode,
            authoritative: false,
            security: Proof::Indeterminate,
            answer: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Unpack a wire message received at `now` into per-section RRsets.
    ///
    /// RRSIGs are folded into the RRset they cover. Trust levels are derived
    /// from the section and the AA bit.
    pub fn from_message(message: &Message, now: u64) -> Self {
        let aa = message.authoritative();
        let answer_trust = if aa {
            TrustLevel::AnswerAa
        } else {
            TrustLevel::Authority
        };

        Self {
            rcode: message.response_code(),
            authoritative: aa,
            security: Proof::Indeterminate,
            answer: rrsets_from_section(message.answers(), answer_trust, now),
            authority: rrsets_from_section(message.name_servers(), TrustLevel::Authority, now),
            additional: additional_rrsets(message.additionals(), now),
        }
    }

    /// All RRsets of the reply in section order.
    pub fn iter(&self) -> impl Iterator<Item = &PackedRrset> {
        self.answer
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PackedRrset> {
        self.answer
            .iter_mut()
            .chain(self.authority.iter_mut())
            .chain(self.additional.iter_mut())
    }

    /// Earliest expiry over all RRsets; `fallback` if the reply is empty.
    pub fn min_expire(&self, fallback: u64) -> u64 {
        self.iter().map(|rrset| rrset.expire).min().unwrap_or(fallback)
    }

    /// Find an answer RRset by owner and type.
    pub fn find_answer(&self, name: &Name, rtype: RecordType) -> Option<&PackedRrset> {
        self.answer
            .iter()
            .find(|rrset| rrset.rtype == rtype && rrset.name == *name)
    }

    /// Find the SOA in the authority section of a negative reply.
    pub fn negative_soa(&self) -> Option<&PackedRrset> {
        self.authority
            .iter()
            .find(|rrset| rrset.rtype == RecordType::SOA)
    }

    /// Render the reply to a wire message for the given query, with TTLs
    /// made relative to `now`. RRSIGs are included only when `dnssec_ok`.
    pub fn to_message(&self, id: u16, qinfo: &QueryInfo, now: u64, dnssec_ok: bool) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_recursion_available(true)
            .set_response_code(self.rcode);
        message.add_query(qinfo.to_query());

        for rrset in &self.answer {
            message.add_answers(export_records(rrset, now, dnssec_ok));
        }
        for rrset in &self.authority {
            message.add_name_servers(export_records(rrset, now, dnssec_ok));
        }
        for rrset in &self.additional {
            message.add_additionals(export_records(rrset, now, dnssec_ok));
        }
        message
    }
}

fn export_records(rrset: &PackedRrset, now: u64, dnssec_ok: bool) -> Vec<Record> {
    let ttl = rrset.ttl(now);
    let mut records: Vec<Record> = rrset
        .rdatas
        .iter()
        .map(|rdata| Record::from_rdata(rrset.name.clone(), ttl, rdata.clone()))
        .collect();
    if dnssec_ok {
        for rrsig in &rrset.rrsigs {
            records.push(Record::from_rdata(
                rrset.name.clone(),
                ttl,
                RData::DNSSEC(hickory_proto::dnssec::rdata::DNSSECRData::RRSIG(
                    rrsig.clone(),
                )),
            ));
        }
    }
    records
}

/// Group a record section into RRsets, attaching RRSIGs to the set whose
/// type they cover.
pub fn rrsets_from_section(records: &[Record], trust: TrustLevel, now: u64) -> Vec<PackedRrset> {
    let mut rrsets: Vec<PackedRrset> = Vec::new();

    for record in records {
        if record.record_type() == RecordType::OPT {
            continue;
        }
        let (effective_type, rrsig) = match record.data().as_dnssec().and_then(|d| d.as_rrsig()) {
            Some(rrsig) => (rrsig.type_covered(), Some(rrsig.clone())),
            None => (record.record_type(), None),
        };

        let entry = rrsets.iter_mut().find(|rrset| {
            rrset.rtype == effective_type
                && rrset.class == record.dns_class()
                && rrset.name == *record.name()
        });
        let entry = match entry {
            Some(entry) => entry,
            None => {
                rrsets.push(PackedRrset {
                    name: record.name().clone(),
                    rtype: effective_type,
                    class: record.dns_class(),
                    flags: 0,
                    expire: now + u64::from(record.ttl()),
                    rdatas: Vec::new(),
                    rrsigs: Vec::new(),
                    trust,
                    security: Proof::Indeterminate,
                    id: 0,
                });
                rrsets.last_mut().expect("just pushed")
            }
        };

        entry.expire = entry.expire.min(now + u64::from(record.ttl()));
        match rrsig {
            Some(rrsig) => entry.rrsigs.push(rrsig),
            None => entry.rdatas.push(record.data().clone()),
        }
    }

    for rrset in &mut rrsets {
        if rrset.rtype == RecordType::NSEC && nsec_has_soa_bit(rrset) {
            rrset.flags |= RRSET_NSEC_AT_APEX;
        }
    }
    rrsets
}

fn additional_rrsets(records: &[Record], now: u64) -> Vec<PackedRrset> {
    let mut rrsets = rrsets_from_section(records, TrustLevel::AdditionalNoAddr, now);
    for rrset in &mut rrsets {
        if matches!(rrset.rtype, RecordType::A | RecordType::AAAA) {
            rrset.trust = TrustLevel::AdditionalAddr;
        }
    }
    rrsets
}

fn nsec_has_soa_bit(rrset: &PackedRrset) -> bool {
    rrset.rdatas.iter().any(|rdata| {
        rdata
            .as_dnssec()
            .and_then(|d| d.as_nsec())
            .map(|nsec| nsec.type_bit_maps().any(|t| t == RecordType::SOA))
            .unwrap_or(false)
    })
}
