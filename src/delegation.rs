//! In-flight zone-cut state.
//!
//! A delegation point is the set of nameservers currently being tried for a
//! query: the NS names of the zone cut, the addresses resolved for them so
//! far, and per-address probe state. Targets are chosen by RTT with a
//! deterministic tie-break, and addresses on the do-not-query list never
//! become targets at all.

use std::net::{IpAddr, SocketAddr};

use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use tracing::debug;

use crate::cache::RrsetCache;
use crate::config::RuntimeConfig;
use crate::infra::InfraCache;
use crate::reply::PackedRrset;

/// Probe state of one candidate server address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    Unused,
    InFlight,
    ProbedGood,
    ProbedBad,
    BlacklistedUntil(u64),
}

/// One candidate server address.
#[derive(Clone, Debug)]
pub struct Target {
    pub addr: SocketAddr,
    pub ns_name: Name,
    pub state: TargetState,
    pub tries: u32,
}

/// One NS name of the zone cut and what we know about its addresses.
#[derive(Clone, Debug)]
pub struct Nameserver {
    pub name: Name,
    /// An A sub-query was issued (or the cache consulted) for this name
    pub queried_a: bool,
    /// Same for AAAA
    pub queried_aaaa: bool,
}

/// The zone cut currently being queried.
#[derive(Clone, Debug)]
pub struct DelegationPoint {
    /// Owner name of the cut; always an ancestor of (or equal to) the name
    /// being chased
    pub name: Name,
    pub nameservers: Vec<Nameserver>,
    pub targets: Vec<Target>,
    /// Forwarder delegations take addresses from configuration and must not
    /// be replaced by referrals
    pub is_forward: bool,
    /// Stub delegations prime from fixed hints
    pub is_stub: bool,
}

impl DelegationPoint {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            nameservers: Vec::new(),
            targets: Vec::new(),
            is_forward: false,
            is_stub: false,
        }
    }

    /// Build from configured forwarder or hint addresses.
    pub fn from_addrs(name: Name, addrs: &[SocketAddr]) -> Self {
        let mut dp = Self::new(name.clone());
        for addr in addrs {
            dp.add_target(name.clone(), *addr);
        }
        dp
    }

    /// Build from a cached NS RRset, merging any cached glue addresses.
    pub fn from_ns_rrset(ns_rrset: &PackedRrset, rrset_cache: &RrsetCache, now: u64) -> Self {
        let mut dp = Self::new(ns_rrset.name.clone());
        for rdata in &ns_rrset.rdatas {
            if let Some(ns) = rdata.as_ns() {
                dp.add_nameserver(ns.0.clone());
            }
        }
        dp.merge_cached_addresses(rrset_cache, now);
        dp
    }

    pub fn add_nameserver(&mut self, name: Name) {
        if !self.nameservers.iter().any(|ns| ns.name == name) {
            self.nameservers.push(Nameserver {
                name,
                queried_a: false,
                queried_aaaa: false,
            });
        }
    }

    pub fn add_target(&mut self, ns_name: Name, addr: SocketAddr) {
        if !self.targets.iter().any(|t| t.addr == addr) {
            self.targets.push(Target {
                addr,
                ns_name,
                state: TargetState::Unused,
                tries: 0,
            });
        }
    }

    /// Pull A/AAAA records for the NS names out of the RRset cache.
    pub fn merge_cached_addresses(&mut self, rrset_cache: &RrsetCache, now: u64) {
        let names: Vec<Name> = self.nameservers.iter().map(|ns| ns.name.clone()).collect();
        for name in names {
            for rtype in [RecordType::A, RecordType::AAAA] {
                if let Some(rrset) = rrset_cache.get(&name, rtype, DNSClass::IN, 0, now) {
                    self.merge_address_rrset(&rrset);
                    if let Some(ns) = self.nameservers.iter_mut().find(|ns| ns.name == name) {
                        match rtype {
                            RecordType::A => ns.queried_a = true,
                            _ => ns.queried_aaaa = true,
                        }
                    }
                }
            }
        }
    }

    /// Add the addresses of an A/AAAA RRset for one of our NS names.
    pub fn merge_address_rrset(&mut self, rrset: &PackedRrset) {
        for rdata in &rrset.rdatas {
            let ip = match rdata {
                RData::A(a) => IpAddr::V4(a.0),
                RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                _ => continue,
            };
            self.add_target(rrset.name.clone(), SocketAddr::new(ip, 53));
        }
    }

    /// NS names that still lack addresses and have unissued address queries.
    pub fn missing_targets(&self) -> Vec<(Name, RecordType)> {
        let mut missing = Vec::new();
        for ns in &self.nameservers {
            let has_addr = self.targets.iter().any(|t| t.ns_name == ns.name);
            if has_addr {
                continue;
            }
            if !ns.queried_a {
                missing.push((ns.name.clone(), RecordType::A));
            }
            if !ns.queried_aaaa {
                missing.push((ns.name.clone(), RecordType::AAAA));
            }
        }
        missing
    }

    pub fn mark_queried(&mut self, name: &Name, rtype: RecordType) {
        if let Some(ns) = self.nameservers.iter_mut().find(|ns| ns.name == *name) {
            match rtype {
                RecordType::A => ns.queried_a = true,
                RecordType::AAAA => ns.queried_aaaa = true,
                _ => {}
            }
        }
    }

    /// Pick the next target to probe.
    ///
    /// Candidates are unused or previously good targets whose address class
    /// is enabled, that are not denied by policy, not skipped by the
    /// infrastructure cache, and not blacklisted. Ordering: lowest RTO
    /// first; at equal RTO IPv6 wins when enabled; remaining ties break on
    /// address order so selection is deterministic.
    pub fn select_target(
        &mut self,
        qtype: RecordType,
        infra: &InfraCache,
        cfg: &RuntimeConfig,
        now: u64,
    ) -> Option<SocketAddr> {
        let zone = self.name.clone();
        let mut best: Option<(u32, SocketAddr)> = None;

        for target in self.targets.iter() {
            match target.state {
                TargetState::Unused | TargetState::ProbedGood => {}
                TargetState::BlacklistedUntil(until) if until <= now => {}
                _ => continue,
            }
            if target.tries >= crate::outbound::OUTBOUND_MSG_RETRY {
                continue;
            }
            let ip = target.addr.ip();
            match ip {
                IpAddr::V4(_) if !cfg.do_ip4 => continue,
                IpAddr::V6(_) if !cfg.do_ip6 => continue,
                _ => {}
            }
            if cfg.is_denied_server(ip) {
                debug!(%ip, "skipping target on the do-not-query list");
                continue;
            }
            if infra.host(&zone, ip, now).should_skip(qtype, now) {
                continue;
            }

            let rto = infra.rto_ms(&zone, ip, now);
            let better = match best {
                None => true,
                Some((best_rto, best_addr)) => {
                    if rto != best_rto {
                        rto < best_rto
                    } else {
                        match (ip, best_addr.ip()) {
                            (IpAddr::V6(_), IpAddr::V4(_)) if cfg.do_ip6 => true,
                            (IpAddr::V4(_), IpAddr::V6(_)) if cfg.do_ip6 => false,
                            _ => target.addr < best_addr,
                        }
                    }
                }
            };
            if better {
                best = Some((rto, target.addr));
            }
        }

        let (_, addr) = best?;
        self.mark(addr, TargetState::InFlight);
        if let Some(target) = self.targets.iter_mut().find(|t| t.addr == addr) {
            target.tries += 1;
        }
        Some(addr)
    }

    pub fn mark(&mut self, addr: SocketAddr, state: TargetState) {
        if let Some(target) = self.targets.iter_mut().find(|t| t.addr == addr) {
            target.state = state;
        }
    }

    /// True when every known target is exhausted or bad.
    pub fn all_targets_spent(&self) -> bool {
        self.targets.iter().all(|t| {
            matches!(
                t.state,
                TargetState::ProbedBad | TargetState::BlacklistedUntil(_)
            ) || t.tries >= crate::outbound::OUTBOUND_MSG_RETRY
        })
    }

    pub fn usable_target_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| {
                !matches!(
                    t.state,
                    TargetState::ProbedBad | TargetState::BlacklistedUntil(_)
                ) && t.tries < crate::outbound::OUTBOUND_MSG_RETRY
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::str::FromStr;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig::from_config(Config::default()).unwrap()
    }

    fn dp_with_targets(addrs: &[&str]) -> DelegationPoint {
        let name = Name::from_str("example.com.").unwrap();
        let addrs: Vec<SocketAddr> = addrs
            .iter()
            .map(|a| SocketAddr::new(a.parse().unwrap(), 53))
            .collect();
        DelegationPoint::from_addrs(name, &addrs)
    }

    #[test]
    fn selection_is_deterministic_on_ties() {
        let infra = InfraCache::new(2, 64, 900);
        let cfg = cfg();
        let mut dp = dp_with_targets(&["192.0.2.9", "192.0.2.1"]);
        // force identical RTOs so only the lexicographic order decides
        infra.record_rtt(&dp.name, "192.0.2.9".parse().unwrap(), 50, 0);
        infra.record_rtt(&dp.name, "192.0.2.1".parse().unwrap(), 50, 0);
        let picked = dp.select_target(RecordType::A, &infra, &cfg, 0).unwrap();
        assert_eq!(picked.ip(), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn in_flight_target_not_reselected() {
        let infra = InfraCache::new(2, 64, 900);
        let cfg = cfg();
        let mut dp = dp_with_targets(&["192.0.2.1"]);
        let first = dp.select_target(RecordType::A, &infra, &cfg, 0);
        assert!(first.is_some());
        assert!(dp.select_target(RecordType::A, &infra, &cfg, 0).is_none());
    }

    #[test]
    fn failed_servers_are_skipped() {
        let infra = InfraCache::new(2, 64, 900);
        let cfg = cfg();
        let mut dp = dp_with_targets(&["192.0.2.1", "192.0.2.2"]);
        for _ in 0..3 {
            infra.record_failure(&dp.name, "192.0.2.1".parse().unwrap(), 0);
        }
        let picked = dp.select_target(RecordType::A, &infra, &cfg, 0).unwrap();
        assert_eq!(picked.ip(), "192.0.2.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn missing_targets_lists_unresolved_ns() {
        let mut dp = DelegationPoint::new(Name::from_str("example.com.").unwrap());
        dp.add_nameserver(Name::from_str("ns1.example.com.").unwrap());
        let missing = dp.missing_targets();
        assert_eq!(missing.len(), 2);
        dp.mark_queried(&Name::from_str("ns1.example.com.").unwrap(), RecordType::A);
        assert_eq!(dp.missing_targets().len(), 1);
    }

    #[test]
    fn denied_addresses_never_selected() {
        let infra = InfraCache::new(2, 64, 900);
        let mut config = Config::default();
        config.do_not_query_address = vec!["192.0.2.0/31".parse().unwrap()];
        let cfg = RuntimeConfig::from_config(config).unwrap();
        let mut dp = dp_with_targets(&["192.0.2.1", "192.0.2.7"]);
        let picked = dp.select_target(RecordType::A, &infra, &cfg, 0).unwrap();
        assert_eq!(picked.ip(), "192.0.2.7".parse::<IpAddr>().unwrap());
    }
}
