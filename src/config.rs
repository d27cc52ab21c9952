//! Configuration for the resolver.
//!
//! The TOML surface uses the same kebab-case option names the server
//! documents. [`Config`] is the raw deserialized form; [`RuntimeConfig`]
//! is the validated form with derived lookup structures (address deny
//! lists, the per-depth target fetch policy, the NSEC3 iteration table)
//! that the resolver core reads at run time.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
};

use hickory_proto::rr::Name;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixSet;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind};

/// Built-in root server addresses, used when no root hints are configured.
pub const ROOT_HINTS: &[&str] = &[
    "198.41.0.4",
    "170.247.170.2",
    "192.33.4.12",
    "199.7.91.13",
    "192.203.230.10",
    "192.5.5.241",
    "192.112.36.4",
    "198.97.190.53",
    "192.36.148.17",
    "192.58.128.30",
    "193.0.14.129",
    "199.7.83.42",
    "202.12.27.33",
    "2001:503:ba3e::2:30",
    "2801:1b8:10::b",
    "2001:500:2::c",
    "2001:500:2d::d",
    "2001:500:a8::e",
    "2001:500:2f::f",
    "2001:500:12::d0d",
    "2001:500:1::53",
    "2001:7fe::53",
    "2001:503:c27::2:30",
    "2001:7fd::1",
    "2001:500:9f::42",
    "2001:dc3::35",
];

/// A forward zone: queries at or under `name` go to fixed upstreams.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ForwardZone {
    pub name: String,
    pub forward_addr: Vec<SocketAddr>,
}

/// A stub zone: the zone cut at `name` is primed from fixed addresses.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct StubZone {
    pub name: String,
    pub stub_addr: Vec<SocketAddr>,
}

/// Raw configuration file contents.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    // -- network
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_interface")]
    pub interface: Vec<IpAddr>,
    #[serde(default)]
    pub outgoing_interface: Vec<IpAddr>,
    #[serde(default = "default_outgoing_range")]
    pub outgoing_range: u16,
    #[serde(default)]
    pub outgoing_port_permit: Vec<String>,
    #[serde(default)]
    pub outgoing_port_avoid: Vec<String>,
    #[serde(default = "default_true")]
    pub do_ip4: bool,
    #[serde(default = "default_true")]
    pub do_ip6: bool,
    #[serde(default = "default_true")]
    pub do_udp: bool,
    #[serde(default = "default_true")]
    pub do_tcp: bool,
    #[serde(default)]
    pub so_rcvbuf: usize,
    #[serde(default)]
    pub so_sndbuf: usize,
    #[serde(default = "default_true")]
    pub so_reuseport: bool,
    #[serde(default = "default_edns_size")]
    pub edns_buffer_size: u16,
    #[serde(default = "default_edns_size")]
    pub max_udp_size: u16,
    /// Milliseconds a query must have run before it can be jostled out
    #[serde(default = "default_jostle_timeout")]
    pub jostle_timeout: u64,
    /// Milliseconds to keep a timed-out socket open, draining late replies
    #[serde(default)]
    pub delay_close: u64,
    #[serde(default = "default_num_queries")]
    pub num_queries_per_thread: usize,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// File of root server addresses; built-in hints when absent
    #[serde(default)]
    pub root_hints: Option<PathBuf>,

    // -- cache sizing
    #[serde(default = "default_cache_size")]
    pub msg_cache_size: usize,
    #[serde(default = "default_slabs")]
    pub msg_cache_slabs: usize,
    #[serde(default = "default_cache_size")]
    pub rrset_cache_size: usize,
    #[serde(default = "default_slabs")]
    pub rrset_cache_slabs: usize,
    #[serde(default = "default_cache_size")]
    pub key_cache_size: usize,
    #[serde(default = "default_slabs")]
    pub key_cache_slabs: usize,
    #[serde(default = "default_infra_hosts")]
    pub infra_cache_numhosts: usize,
    #[serde(default = "default_slabs")]
    pub infra_cache_slabs: usize,
    #[serde(default = "default_neg_cache_size")]
    pub neg_cache_size: usize,
    /// Accepted and ignored (legacy)
    #[serde(default)]
    pub infra_lame_ttl: Option<u64>,
    /// Accepted and ignored (legacy)
    #[serde(default)]
    pub infra_cache_lame_size: Option<usize>,
    #[serde(default = "default_host_ttl")]
    pub host_ttl: u64,

    // -- resolution behaviour
    #[serde(default = "default_target_fetch_policy")]
    pub target_fetch_policy: String,
    #[serde(default)]
    pub harden_referral_path: bool,
    #[serde(default = "default_true")]
    pub harden_glue: bool,
    #[serde(default = "default_true")]
    pub harden_dnssec_stripped: bool,
    #[serde(default = "default_true")]
    pub harden_below_nxdomain: bool,
    #[serde(default)]
    pub use_caps_for_id: bool,
    #[serde(default)]
    pub prefetch: bool,
    #[serde(default)]
    pub prefetch_key: bool,
    /// Zero disables the unwanted-reply counter
    #[serde(default)]
    pub unwanted_reply_threshold: u64,
    #[serde(default)]
    pub do_not_query_address: Vec<IpNet>,
    #[serde(default = "default_true")]
    pub do_not_query_localhost: bool,

    // -- TTL bounds
    #[serde(default)]
    pub cache_min_ttl: u64,
    #[serde(default = "default_cache_max_ttl")]
    pub cache_max_ttl: u64,
    #[serde(default = "default_bogus_ttl")]
    pub bogus_ttl: u64,

    // -- validation
    #[serde(default)]
    pub trust_anchor_file: Option<PathBuf>,
    #[serde(default)]
    pub trust_anchor: Vec<String>,
    #[serde(default)]
    pub auto_trust_anchor_file: Vec<PathBuf>,
    #[serde(default)]
    pub trusted_keys_file: Vec<PathBuf>,
    /// Accepted for compatibility; lookaside validation was decommissioned
    #[serde(default)]
    pub dlv_anchor_file: Option<PathBuf>,
    #[serde(default)]
    pub domain_insecure: Vec<String>,
    /// Fixed validation epoch for testing; zero uses the wall clock
    #[serde(default)]
    pub val_override_date: u64,
    #[serde(default = "default_sig_skew_min")]
    pub val_sig_skew_min: u64,
    #[serde(default = "default_sig_skew_max")]
    pub val_sig_skew_max: u64,
    #[serde(default = "default_true")]
    pub val_clean_additional: bool,
    #[serde(default)]
    pub val_permissive_mode: bool,
    #[serde(default)]
    pub ignore_cd_flag: bool,
    #[serde(default = "default_nsec3_iterations")]
    pub val_nsec3_keysize_iterations: String,
    #[serde(default = "default_add_holddown")]
    pub add_holddown: u64,
    #[serde(default = "default_del_holddown")]
    pub del_holddown: u64,
    #[serde(default = "default_keep_missing")]
    pub keep_missing: u64,

    // -- zones
    #[serde(default)]
    pub forward_zone: Vec<ForwardZone>,
    #[serde(default)]
    pub stub_zone: Vec<StubZone>,
}

fn default_port() -> u16 {
    53
}
fn default_interface() -> Vec<IpAddr> {
    vec![IpAddr::from([0, 0, 0, 0])]
}
fn default_outgoing_range() -> u16 {
    4096
}
fn default_true() -> bool {
    true
}
fn default_edns_size() -> u16 {
    1232
}
fn default_jostle_timeout() -> u64 {
    200
}
fn default_num_queries() -> usize {
    1024
}
fn default_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_cache_size() -> usize {
    4 * 1024 * 1024
}
fn default_neg_cache_size() -> usize {
    1024 * 1024
}
fn default_slabs() -> usize {
    4
}
fn default_infra_hosts() -> usize {
    10_000
}
fn default_host_ttl() -> u64 {
    900
}
fn default_target_fetch_policy() -> String {
    "3 2 1 0 0".to_string()
}
fn default_cache_max_ttl() -> u64 {
    86_400
}
fn default_bogus_ttl() -> u64 {
    60
}
fn default_sig_skew_min() -> u64 {
    3_600
}
fn default_sig_skew_max() -> u64 {
    86_400
}
fn default_nsec3_iterations() -> String {
    "1024 150 2048 500 4096 2500".to_string()
}
fn default_add_holddown() -> u64 {
    30 * 24 * 3_600
}
fn default_del_holddown() -> u64 {
    30 * 24 * 3_600
}
fn default_keep_missing() -> u64 {
    366 * 24 * 3_600
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Read a configuration file.
    pub fn read_config(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)
            .map_err(|e| ErrorKind::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml(toml: &str) -> Result<Self, Error> {
        toml::from_str(toml).map_err(|e| ErrorKind::Config(e.to_string()).into())
    }
}

/// Validated configuration with derived lookup structures.
pub struct RuntimeConfig {
    pub cfg: Config,
    /// Per-depth target fetch counts; -1 = fetch all, 0 = on demand
    pub target_fetch_policy: Vec<i32>,
    /// Sorted (key size bits, max iterations) pairs
    pub nsec3_iteration_limits: Vec<(usize, usize)>,
    pub domain_insecure: Vec<Name>,
    pub forward_zones: Vec<(Name, Vec<SocketAddr>)>,
    pub stub_zones: Vec<(Name, Vec<SocketAddr>)>,
    pub root_hint_addrs: Vec<SocketAddr>,
    pub outgoing_ports: Vec<(u16, u16)>,
    pub do_ip4: bool,
    pub do_ip6: bool,
    deny_v4: PrefixSet<Ipv4Net>,
    deny_v6: PrefixSet<Ipv6Net>,
}

impl RuntimeConfig {
    pub fn from_config(cfg: Config) -> Result<Self, Error> {
        let target_fetch_policy = parse_fetch_policy(&cfg.target_fetch_policy)?;
        let nsec3_iteration_limits = parse_nsec3_limits(&cfg.val_nsec3_keysize_iterations)?;

        let domain_insecure = cfg
            .domain_insecure
            .iter()
            .map(|s| parse_name(s))
            .collect::<Result<Vec<_>, _>>()?;

        let forward_zones = cfg
            .forward_zone
            .iter()
            .map(|z| Ok((parse_name(&z.name)?, z.forward_addr.clone())))
            .collect::<Result<Vec<_>, Error>>()?;
        let stub_zones = cfg
            .stub_zone
            .iter()
            .map(|z| Ok((parse_name(&z.name)?, z.stub_addr.clone())))
            .collect::<Result<Vec<_>, Error>>()?;

        let root_hint_addrs = match &cfg.root_hints {
            Some(path) => read_root_hints(path)?,
            None => ROOT_HINTS
                .iter()
                .map(|a| SocketAddr::new(a.parse().expect("built-in hint"), 53))
                .collect(),
        };

        let mut deny_v4 = PrefixSet::new();
        let mut deny_v6 = PrefixSet::new();
        for network in &cfg.do_not_query_address {
            info!("adding {network} to the do-not-query list");
            match network {
                IpNet::V4(network) => {
                    deny_v4.insert(*network);
                }
                IpNet::V6(network) => {
                    deny_v6.insert(*network);
                }
            }
        }
        if cfg.do_not_query_localhost {
            deny_v4.insert("127.0.0.0/8".parse().expect("static prefix"));
            deny_v6.insert("::1/128".parse().expect("static prefix"));
        }

        let mut outgoing_ports = Vec::new();
        for spec in &cfg.outgoing_port_permit {
            outgoing_ports.push(parse_port_range(spec)?);
        }
        if outgoing_ports.is_empty() {
            outgoing_ports.push((2048, 65_535));
        }
        for spec in &cfg.outgoing_port_avoid {
            let (lo, hi) = parse_port_range(spec)?;
            outgoing_ports = subtract_range(outgoing_ports, lo, hi);
        }
        if outgoing_ports.is_empty() {
            return Err(ErrorKind::Config(
                "outgoing-port-avoid leaves no usable source ports".to_string(),
            )
            .into());
        }

        if cfg.infra_lame_ttl.is_some() || cfg.infra_cache_lame_size.is_some() {
            debug!("infra-lame-ttl and infra-cache-lame-size are ignored");
        }
        if cfg.dlv_anchor_file.is_some() {
            info!("dlv-anchor-file is decommissioned and ignored");
        }

        let do_ip4 = cfg.do_ip4;
        let do_ip6 = cfg.do_ip6;
        Ok(Self {
            cfg,
            target_fetch_policy,
            nsec3_iteration_limits,
            domain_insecure,
            forward_zones,
            stub_zones,
            root_hint_addrs,
            outgoing_ports,
            do_ip4,
            do_ip6,
            deny_v4,
            deny_v6,
        })
    }

    /// Check an upstream address against the do-not-query list.
    pub fn is_denied_server(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.deny_v4.get_spm(&Ipv4Net::from(ip)).is_some(),
            IpAddr::V6(ip) => self.deny_v6.get_spm(&Ipv6Net::from(ip)).is_some(),
        }
    }

    /// Target fetch count for a dependency depth; the last entry repeats.
    pub fn fetch_count_at_depth(&self, depth: usize) -> i32 {
        self.target_fetch_policy
            .get(depth)
            .or_else(|| self.target_fetch_policy.last())
            .copied()
            .unwrap_or(0)
    }

    /// Maximum dependency depth sub-queries may reach.
    pub fn max_dependency_depth(&self) -> usize {
        self.target_fetch_policy.len()
    }

    /// NSEC3 iteration ceiling for a signing key size in bits.
    pub fn nsec3_max_iterations(&self, key_bits: usize) -> usize {
        let mut limit = 0;
        for &(size, iterations) in &self.nsec3_iteration_limits {
            if key_bits <= size {
                return iterations;
            }
            limit = iterations;
        }
        limit
    }

    /// The forwarder list for a name, from the most specific forward zone.
    pub fn forwarders_for(&self, name: &Name) -> Option<(&Name, &[SocketAddr])> {
        self.forward_zones
            .iter()
            .filter(|(zone, _)| zone.zone_of(name))
            .max_by_key(|(zone, _)| zone.num_labels())
            .map(|(zone, addrs)| (zone, addrs.as_slice()))
    }

    /// The stub addresses for a zone cut, if it is configured as a stub.
    pub fn stub_for(&self, name: &Name) -> Option<&[SocketAddr]> {
        self.stub_zones
            .iter()
            .find(|(zone, _)| zone == name)
            .map(|(_, addrs)| addrs.as_slice())
    }

    /// Whether validation is switched off below this name.
    pub fn is_domain_insecure(&self, name: &Name) -> bool {
        self.domain_insecure.iter().any(|zone| zone.zone_of(name))
    }
}

fn parse_name(s: &str) -> Result<Name, Error> {
    let mut name =
        Name::from_str(s).map_err(|e| Error::from(ErrorKind::Config(format!("{s}: {e}"))))?;
    name.set_fqdn(true);
    Ok(name)
}

fn parse_fetch_policy(s: &str) -> Result<Vec<i32>, Error> {
    let policy = s
        .split_whitespace()
        .map(|tok| {
            tok.parse::<i32>()
                .map_err(|e| Error::from(ErrorKind::Config(format!("target-fetch-policy: {e}"))))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if policy.is_empty() {
        return Err(ErrorKind::Config("target-fetch-policy is empty".to_string()).into());
    }
    Ok(policy)
}

fn parse_nsec3_limits(s: &str) -> Result<Vec<(usize, usize)>, Error> {
    let numbers = s
        .split_whitespace()
        .map(|tok| {
            tok.parse::<usize>().map_err(|e| {
                Error::from(ErrorKind::Config(format!("val-nsec3-keysize-iterations: {e}")))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if numbers.len() % 2 != 0 {
        return Err(ErrorKind::Config(
            "val-nsec3-keysize-iterations needs size/count pairs".to_string(),
        )
        .into());
    }
    let pairs: Vec<(usize, usize)> = numbers.chunks(2).map(|c| (c[0], c[1])).collect();
    if pairs.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(ErrorKind::Config(
            "val-nsec3-keysize-iterations key sizes must increase".to_string(),
        )
        .into());
    }
    Ok(pairs)
}

fn parse_port_range(spec: &str) -> Result<(u16, u16), Error> {
    let parse = |tok: &str| {
        tok.trim()
            .parse::<u16>()
            .map_err(|e| Error::from(ErrorKind::Config(format!("port range {spec}: {e}"))))
    };
    match spec.split_once('-') {
        Some((lo, hi)) => {
            let (lo, hi) = (parse(lo)?, parse(hi)?);
            if lo > hi {
                return Err(ErrorKind::Config(format!("port range {spec} is inverted")).into());
            }
            Ok((lo, hi))
        }
        None => {
            let port = parse(spec)?;
            Ok((port, port))
        }
    }
}

fn subtract_range(ranges: Vec<(u16, u16)>, lo: u16, hi: u16) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    for (a, b) in ranges {
        if hi < a || lo > b {
            out.push((a, b));
            continue;
        }
        if lo > a {
            out.push((a, lo - 1));
        }
        if hi < b {
            out.push((hi + 1, b));
        }
    }
    out
}

fn read_root_hints(path: &Path) -> Result<Vec<SocketAddr>, Error> {
    let text = fs::read_to_string(path)
        .map_err(|e| ErrorKind::Config(format!("root-hints {}: {e}", path.display())))?;
    let mut addrs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        // accept either bare addresses or master-file A/AAAA lines
        let candidate = line.split_whitespace().last().unwrap_or(line);
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            addrs.push(SocketAddr::new(ip, 53));
        }
    }
    if addrs.is_empty() {
        return Err(ErrorKind::Config(format!(
            "root-hints {} holds no addresses",
            path.display()
        ))
        .into());
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let rc = RuntimeConfig::from_config(Config::default()).unwrap();
        assert_eq!(rc.cfg.port, 53);
        assert_eq!(rc.target_fetch_policy, vec![3, 2, 1, 0, 0]);
        assert_eq!(rc.nsec3_iteration_limits[0], (1024, 150));
        assert!(!rc.root_hint_addrs.is_empty());
        // localhost is denied by default
        assert!(rc.is_denied_server("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn unknown_option_is_rejected() {
        assert!(Config::from_toml("no-such-option = 1").is_err());
    }

    #[test]
    fn forward_zone_longest_match_wins() {
        let cfg = Config::from_toml(
            r#"
            [[forward-zone]]
            name = "example.com."
            forward-addr = ["192.0.2.1:53"]

            [[forward-zone]]
            name = "sub.example.com."
            forward-addr = ["192.0.2.2:53"]
            "#,
        )
        .unwrap();
        let rc = RuntimeConfig::from_config(cfg).unwrap();
        let (zone, addrs) = rc
            .forwarders_for(&Name::from_str("a.sub.example.com.").unwrap())
            .unwrap();
        assert_eq!(zone, &Name::from_str("sub.example.com.").unwrap());
        assert_eq!(addrs[0], "192.0.2.2:53".parse().unwrap());
    }

    #[test]
    fn port_avoid_splits_ranges() {
        let cfg = Config::from_toml(
            r#"
            outgoing-port-permit = ["2048-4096"]
            outgoing-port-avoid = ["3000-3010"]
            "#,
        )
        .unwrap();
        let rc = RuntimeConfig::from_config(cfg).unwrap();
        assert_eq!(rc.outgoing_ports, vec![(2048, 2999), (3011, 4096)]);
    }

    #[test]
    fn nsec3_limit_table_lookup() {
        let rc = RuntimeConfig::from_config(Config::default()).unwrap();
        assert_eq!(rc.nsec3_max_iterations(1024), 150);
        assert_eq!(rc.nsec3_max_iterations(2000), 500);
        assert_eq!(rc.nsec3_max_iterations(8192), 2500);
    }

    #[test]
    fn fetch_policy_repeats_last_entry() {
        let rc = RuntimeConfig::from_config(Config::default()).unwrap();
        assert_eq!(rc.fetch_count_at_depth(0), 3);
        assert_eq!(rc.fetch_count_at_depth(9), 0);
    }
}
