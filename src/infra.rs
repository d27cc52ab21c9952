//! Per-server infrastructure cache.
//!
//! Tracks, for each (zone, server address) pair: a smoothed RTT with its
//! retransmission timeout, a consecutive-failure count, whether the server
//! handles EDNS0, and lameness per query type. Target selection and outbound
//! timeouts are driven from here.

use std::net::IpAddr;

use hickory_proto::rr::{Name, RecordType};

use crate::cache::slab::{MemSize, SlabCache};

/// RTO seed for a server we have never measured, in milliseconds.
pub const UNKNOWN_SERVER_NICENESS: u32 = 376;
/// Ceiling on the retransmission timeout, in milliseconds.
pub const RTT_MAX_TIMEOUT: u32 = 120_000;
/// Consecutive failures after which a target is skipped for the host TTL.
pub const FAILURE_SKIP_THRESHOLD: u32 = 3;

/// Key of an infrastructure entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InfraKey {
    pub zone: Name,
    pub addr: IpAddr,
}

impl InfraKey {
    fn hash_value(&self) -> u32 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

/// Smoothed RTT estimate with Jacobson-style variance tracking.
#[derive(Clone, Copy, Debug)]
pub struct RttEstimate {
    /// Smoothed round-trip time, milliseconds
    pub srtt: f64,
    /// Mean deviation, milliseconds
    pub rttvar: f64,
    /// Current retransmission timeout, milliseconds
    pub rto: u32,
}

impl RttEstimate {
    fn seed() -> Self {
        Self {
            srtt: f64::from(UNKNOWN_SERVER_NICENESS),
            rttvar: 0.0,
            rto: UNKNOWN_SERVER_NICENESS,
        }
    }

    fn update(&mut self, rtt_ms: u32) {
        let rtt = f64::from(rtt_ms);
        let err = (rtt - self.srtt).abs();
        self.rttvar = 0.75 * self.rttvar + 0.25 * err;
        self.srtt = 0.875 * self.srtt + 0.125 * rtt;
        self.rto = ((self.srtt + 4.0 * self.rttvar) as u32)
            .max(UNKNOWN_SERVER_NICENESS)
            .min(RTT_MAX_TIMEOUT);
    }

    fn backoff(&mut self) {
        self.rto = self.rto.saturating_mul(2).min(RTT_MAX_TIMEOUT);
    }
}

/// State kept per (zone, server address).
#[derive(Clone, Debug)]
pub struct HostEntry {
    pub rtt: RttEstimate,
    pub consecutive_failures: u32,
    pub last_failure: u64,
    /// None until probed; Some(false) for servers that drop EDNS queries
    pub edns_supported: Option<bool>,
    /// Lame for address queries (A/AAAA)
    pub lame_type_a: bool,
    /// Lame for everything else
    pub lame_other: bool,
    /// Entry expiry; state older than the host TTL starts fresh
    pub expire: u64,
}

impl MemSize for HostEntry {
    fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + 64
    }
}

impl HostEntry {
    fn fresh(now: u64, host_ttl: u64) -> Self {
        Self {
            rtt: RttEstimate::seed(),
            consecutive_failures: 0,
            last_failure: 0,
            edns_supported: None,
            lame_type_a: false,
            lame_other: false,
            expire: now + host_ttl,
        }
    }

    /// Whether the server should be skipped for this query type right now.
    ///
    /// The failure window is the entry lifetime itself: expired entries are
    /// re-seeded, so a threshold reached here always happened inside the
    /// host TTL.
    pub fn should_skip(&self, qtype: RecordType, _now: u64) -> bool {
        if self.consecutive_failures >= FAILURE_SKIP_THRESHOLD {
            return true;
        }
        match qtype {
            RecordType::A | RecordType::AAAA => self.lame_type_a,
            _ => self.lame_other,
        }
    }
}

/// Shared cache of per-server state, sharded like the other caches but
/// bounded by host count rather than bytes.
pub struct InfraCache {
    table: SlabCache<InfraKey, HostEntry>,
    host_ttl: u64,
}

impl InfraCache {
    pub fn new(slabs: usize, numhosts: usize, host_ttl: u64) -> Self {
        // entries are small and uniform; convert the host budget to bytes
        let entry = std::mem::size_of::<HostEntry>() + 64;
        Self {
            table: SlabCache::new(slabs, numhosts.max(1) * entry),
            host_ttl,
        }
    }

    /// Snapshot of a host entry, seeding a fresh one if absent or expired.
    pub fn host(&self, zone: &Name, addr: IpAddr, now: u64) -> HostEntry {
        let key = InfraKey {
            zone: zone.clone(),
            addr,
        };
        if let Some(entry) = self.table.lookup(key.hash_value(), &key) {
            let entry = entry.read().clone();
            if entry.expire > now {
                return entry;
            }
        }
        HostEntry::fresh(now, self.host_ttl)
    }

    /// The timeout to arm for the next query to this server.
    pub fn rto_ms(&self, zone: &Name, addr: IpAddr, now: u64) -> u32 {
        self.host(zone, addr, now).rtt.rto
    }

    fn mutate(&self, zone: &Name, addr: IpAddr, now: u64, f: impl FnOnce(&mut HostEntry)) {
        let key = InfraKey {
            zone: zone.clone(),
            addr,
        };
        let hash = key.hash_value();
        if let Some(entry) = self.table.lookup(hash, &key) {
            let mut guard = entry.write();
            if guard.expire > now {
                f(&mut guard);
                return;
            }
        }
        let mut fresh = HostEntry::fresh(now, self.host_ttl);
        f(&mut fresh);
        self.table.insert(hash, key, fresh);
    }

    /// Record a measured round trip.
    pub fn record_rtt(&self, zone: &Name, addr: IpAddr, rtt_ms: u32, now: u64) {
        self.mutate(zone, addr, now, |host| {
            host.rtt.update(rtt_ms);
            host.consecutive_failures = 0;
        });
    }

    /// Record a timeout or connection failure; doubles the RTO.
    pub fn record_failure(&self, zone: &Name, addr: IpAddr, now: u64) {
        self.mutate(zone, addr, now, |host| {
            host.rtt.backoff();
            host.consecutive_failures += 1;
            host.last_failure = now;
        });
    }

    /// Record that the server answered lamely for this query type.
    pub fn record_lame(&self, zone: &Name, addr: IpAddr, qtype: RecordType, now: u64) {
        self.mutate(zone, addr, now, |host| match qtype {
            RecordType::A | RecordType::AAAA => host.lame_type_a = true,
            _ => host.lame_other = true,
        });
    }

    /// Record whether EDNS0 worked towards this server.
    pub fn record_edns(&self, zone: &Name, addr: IpAddr, supported: bool, now: u64) {
        self.mutate(zone, addr, now, |host| {
            host.edns_supported = Some(supported);
        });
    }

    pub fn clear(&self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn zone() -> Name {
        Name::from_str("example.com.").unwrap()
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn unknown_server_uses_seed_timeout() {
        let infra = InfraCache::new(2, 128, 900);
        assert_eq!(infra.rto_ms(&zone(), addr(1), 0), UNKNOWN_SERVER_NICENESS);
    }

    #[test]
    fn rtt_measurements_converge() {
        let infra = InfraCache::new(2, 128, 900);
        for _ in 0..16 {
            infra.record_rtt(&zone(), addr(1), 40, 10);
        }
        let host = infra.host(&zone(), addr(1), 10);
        assert!(host.rtt.srtt < 100.0);
        assert_eq!(host.consecutive_failures, 0);
    }

    #[test]
    fn failures_back_off_and_skip() {
        let infra = InfraCache::new(2, 128, 900);
        let before = infra.rto_ms(&zone(), addr(2), 10);
        for _ in 0..3 {
            infra.record_failure(&zone(), addr(2), 10);
        }
        let host = infra.host(&zone(), addr(2), 10);
        assert!(host.rtt.rto > before);
        assert!(host.should_skip(RecordType::NS, 10));
    }

    #[test]
    fn rto_is_capped() {
        let infra = InfraCache::new(2, 128, 900);
        for _ in 0..32 {
            infra.record_failure(&zone(), addr(3), 10);
        }
        assert_eq!(infra.host(&zone(), addr(3), 10).rtt.rto, RTT_MAX_TIMEOUT);
    }

    #[test]
    fn state_expires_after_host_ttl() {
        let infra = InfraCache::new(2, 128, 900);
        for _ in 0..3 {
            infra.record_failure(&zone(), addr(4), 10);
        }
        assert!(infra.host(&zone(), addr(4), 10).should_skip(RecordType::NS, 10));
        // past the host TTL the server gets a clean slate
        let later = infra.host(&zone(), addr(4), 1_000);
        assert!(!later.should_skip(RecordType::NS, 1_000));
    }

    #[test]
    fn lameness_is_per_query_type() {
        let infra = InfraCache::new(2, 128, 900);
        infra.record_lame(&zone(), addr(5), RecordType::NS, 10);
        let host = infra.host(&zone(), addr(5), 10);
        assert!(host.should_skip(RecordType::NS, 10));
        assert!(!host.should_skip(RecordType::A, 10));
    }
}
