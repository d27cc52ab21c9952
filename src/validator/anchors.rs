//! Trust anchor storage.
//!
//! Anchors come from configuration (`trust-anchor`, `trust-anchor-file`,
//! `trusted-keys-file`) as DS or DNSKEY records, and from
//! `auto-trust-anchor-file` anchors that additionally track RFC 5011 key
//! rollover state. The rollover state file is the only thing the resolver
//! ever writes back to disk.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use data_encoding::{BASE64, BASE64_NOPAD, HEXUPPER_PERMISSIVE};
use hickory_proto::{
    dnssec::{
        rdata::{DNSKEY, DS},
        Verifier,
    },
    op::Message,
    rr::{Name, Record, RecordType},
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::reply::PackedRrset;

/// RFC 5011 key states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutrState {
    /// Newly seen SEP key waiting out the add holddown
    AddPend,
    /// Usable trust anchor
    Valid,
    /// Valid key that vanished from the zone's DNSKEY set
    Missing,
    /// Key seen with the revoke bit; waiting out the delete holddown
    Revoked,
    /// Key scheduled for removal at the next write
    Removed,
}

impl AutrState {
    fn to_num(self) -> u8 {
        match self {
            Self::AddPend => 1,
            Self::Valid => 2,
            Self::Missing => 3,
            Self::Revoked => 4,
            Self::Removed => 5,
        }
    }

    fn from_num(n: u8) -> Option<Self> {
        Some(match n {
            1 => Self::AddPend,
            2 => Self::Valid,
            3 => Self::Missing,
            4 => Self::Revoked,
            5 => Self::Removed,
            _ => return None,
        })
    }
}

/// One tracked key of an automated anchor.
#[derive(Clone, Debug)]
pub struct AutrKey {
    pub dnskey: DNSKEY,
    pub state: AutrState,
    /// When the key entered its current state
    pub since: u64,
}

/// Rollover state for one `auto-trust-anchor-file` anchor.
#[derive(Clone, Debug)]
pub struct AutoAnchor {
    pub path: PathBuf,
    pub keys: Vec<AutrKey>,
}

/// The anchor set for one owner name.
#[derive(Clone, Debug, Default)]
pub struct TrustAnchor {
    pub name: Name,
    pub ds: Vec<DS>,
    pub dnskeys: Vec<DNSKEY>,
    pub auto: Option<AutoAnchor>,
}

impl TrustAnchor {
    /// The DS records and DNSKEYs currently usable as anchor material.
    pub fn effective(&self) -> (Vec<DS>, Vec<DNSKEY>) {
        let mut dnskeys = self.dnskeys.clone();
        if let Some(auto) = &self.auto {
            for key in &auto.keys {
                if key.state == AutrState::Valid {
                    dnskeys.push(key.dnskey.clone());
                }
            }
        }
        (self.ds.clone(), dnskeys)
    }
}

/// All configured trust anchors, keyed by owner name.
pub struct TrustAnchorStore {
    anchors: RwLock<HashMap<Name, TrustAnchor>>,
}

impl TrustAnchorStore {
    pub fn empty() -> Self {
        Self {
            anchors: RwLock::new(HashMap::new()),
        }
    }

    /// Load every anchor source named in the configuration.
    pub fn from_runtime_config(cfg: &RuntimeConfig) -> Result<Self> {
        let store = Self::empty();
        for line in &cfg.cfg.trust_anchor {
            store.add_anchor_line(line)?;
        }
        if let Some(path) = &cfg.cfg.trust_anchor_file {
            store.load_anchor_file(path)?;
        }
        for path in &cfg.cfg.trusted_keys_file {
            store.load_anchor_file(path)?;
        }
        for path in &cfg.cfg.auto_trust_anchor_file {
            store.load_auto_anchor(path)?;
        }
        let count = store.anchors.read().len();
        if count > 0 {
            info!("{count} trust anchor point(s) configured");
        }
        Ok(store)
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.read().is_empty()
    }

    /// The most specific anchor at or above `name`.
    pub fn closest_ancestor(&self, name: &Name) -> Option<Name> {
        let anchors = self.anchors.read();
        let mut current = name.clone();
        loop {
            if anchors.contains_key(&current) {
                return Some(current);
            }
            if current.is_root() {
                return None;
            }
            current = current.base_name();
        }
    }

    pub fn get(&self, name: &Name) -> Option<TrustAnchor> {
        self.anchors.read().get(name).cloned()
    }

    /// Parse one `trust-anchor:` value and add it.
    pub fn add_anchor_line(&self, line: &str) -> Result<()> {
        let (name, record) = parse_anchor_line(line)?;
        self.add_record(name, &record);
        Ok(())
    }

    fn add_record(&self, name: Name, record: &Record) {
        let mut anchors = self.anchors.write();
        let anchor = anchors.entry(name.clone()).or_insert_with(|| TrustAnchor {
            name,
            ..TrustAnchor::default()
        });
        if let Some(dnssec) = record.data().as_dnssec() {
            if let Some(ds) = dnssec.as_ds() {
                anchor.ds.push(ds.clone());
            } else if let Some(dnskey) = dnssec.as_dnskey() {
                anchor.dnskeys.push(dnskey.clone());
            }
        }
    }

    fn load_anchor_file(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|e| ErrorKind::Anchor(format!("{}: {e}", path.display())))?;
        for line in anchor_lines(&text) {
            self.add_anchor_line(line)?;
        }
        Ok(())
    }

    /// Load an automated anchor with any saved rollover state.
    fn load_auto_anchor(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|e| ErrorKind::Anchor(format!("{}: {e}", path.display())))?;
        let mut name: Option<Name> = None;
        let mut keys = Vec::new();
        let mut plain_ds = Vec::new();
        for line in anchor_lines(&text) {
            let (state, since) = parse_autr_comment(line);
            let bare = line.split(";;").next().unwrap_or(line);
            let (owner, record) = parse_anchor_line(bare)?;
            match name {
                Some(ref name) if *name != owner => {
                    return Err(ErrorKind::Anchor(format!(
                        "{}: multiple owner names in one auto anchor",
                        path.display()
                    ))
                    .into());
                }
                None => name = Some(owner.clone()),
                _ => {}
            }
            if let Some(dnssec) = record.data().as_dnssec() {
                if let Some(dnskey) = dnssec.as_dnskey() {
                    keys.push(AutrKey {
                        dnskey: dnskey.clone(),
                        state: state.unwrap_or(AutrState::Valid),
                        since,
                    });
                } else if let Some(ds) = dnssec.as_ds() {
                    plain_ds.push(ds.clone());
                }
            }
        }
        let Some(name) = name else {
            return Err(
                ErrorKind::Anchor(format!("{}: no anchors in file", path.display())).into(),
            );
        };

        let mut anchors = self.anchors.write();
        let anchor = anchors.entry(name.clone()).or_insert_with(|| TrustAnchor {
            name,
            ..TrustAnchor::default()
        });
        anchor.ds.extend(plain_ds);
        anchor.auto = Some(AutoAnchor {
            path: path.to_path_buf(),
            keys,
        });
        Ok(())
    }

    /// Feed a validated DNSKEY RRset for an anchor zone into the rollover
    /// state machine, persisting any change.
    pub fn probe(&self, zone: &Name, dnskeys: &PackedRrset, now: u64, cfg: &RuntimeConfig) {
        let mut anchors = self.anchors.write();
        let Some(anchor) = anchors.get_mut(zone) else {
            return;
        };
        let Some(auto) = anchor.auto.as_mut() else {
            return;
        };

        let observed: Vec<&DNSKEY> = dnskeys
            .rdatas
            .iter()
            .filter_map(|r| r.as_dnssec().and_then(|d| d.as_dnskey()))
            .collect();

        let mut changed = false;
        // new SEP keys start the add holddown
        for key in observed.iter().filter(|k| k.secure_entry_point()) {
            let known = auto.keys.iter().any(|a| a.dnskey == **key);
            if !known && !key.revoke() {
                debug!(%zone, "new anchor candidate enters add-pending");
                auto.keys.push(AutrKey {
                    dnskey: (*key).clone(),
                    state: AutrState::AddPend,
                    since: now,
                });
                changed = true;
            }
        }

        for tracked in auto.keys.iter_mut() {
            let present = observed.iter().any(|k| **k == tracked.dnskey);
            let tracked_bytes = key_bytes(&tracked.dnskey);
            let revoked = observed
                .iter()
                .any(|k| k.revoke() && key_bytes(k) == tracked_bytes);
            match tracked.state {
                AutrState::AddPend => {
                    if revoked {
                        tracked.state = AutrState::Removed;
                        tracked.since = now;
                        changed = true;
                    } else if !present {
                        // interrupted rollover; restart the holddown later
                        tracked.state = AutrState::Removed;
                        tracked.since = now;
                        changed = true;
                    } else if now.saturating_sub(tracked.since) >= cfg.cfg.add_holddown {
                        info!(%zone, "anchor candidate becomes valid");
                        tracked.state = AutrState::Valid;
                        tracked.since = now;
                        changed = true;
                    }
                }
                AutrState::Valid => {
                    if revoked {
                        info!(%zone, "trust anchor revoked");
                        tracked.state = AutrState::Revoked;
                        tracked.since = now;
                        changed = true;
                    } else if !present {
                        tracked.state = AutrState::Missing;
                        tracked.since = now;
                        changed = true;
                    }
                }
                AutrState::Missing => {
                    if present {
                        tracked.state = AutrState::Valid;
                        tracked.since = now;
                        changed = true;
                    } else if now.saturating_sub(tracked.since) >= cfg.cfg.keep_missing {
                        tracked.state = AutrState::Removed;
                        tracked.since = now;
                        changed = true;
                    }
                }
                AutrState::Revoked => {
                    if now.saturating_sub(tracked.since) >= cfg.cfg.del_holddown {
                        tracked.state = AutrState::Removed;
                        tracked.since = now;
                        changed = true;
                    }
                }
                AutrState::Removed => {}
            }
        }

        let before = auto.keys.len();
        auto.keys.retain(|k| k.state != AutrState::Removed);
        changed |= auto.keys.len() != before;

        if changed {
            if let Err(e) = write_auto_anchor(&anchor.name, anchor.auto.as_ref().expect("set")) {
                warn!("failed to persist anchor state: {e}");
            }
        }
    }
}

fn anchor_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with(';') && !l.starts_with('#'))
}

fn parse_autr_comment(line: &str) -> (Option<AutrState>, u64) {
    let mut state = None;
    let mut since = 0;
    if let Some(idx) = line.find(";;") {
        for token in line[idx..].split_whitespace() {
            if let Some(v) = token.strip_prefix(";;state=") {
                state = v.parse::<u8>().ok().and_then(AutrState::from_num);
            } else if let Some(v) = token.strip_prefix(";;since=") {
                since = v.parse().unwrap_or(0);
            }
        }
    }
    (state, since)
}

fn write_auto_anchor(name: &Name, auto: &AutoAnchor) -> Result<()> {
    let mut out = String::new();
    out.push_str("; autotrust trust anchor file\n");
    for key in &auto.keys {
        let Some(bytes) = key_bytes(&key.dnskey) else {
            warn!(%name, "skipping anchor key with unreadable key material");
            continue;
        };
        let mut flags = 0u16;
        if key.dnskey.zone_key() {
            flags |= 0x0100;
        }
        if key.dnskey.secure_entry_point() {
            flags |= 0x0001;
        }
        if key.dnskey.revoke() {
            flags |= 0x0080;
        }
        out.push_str(&format!(
            "{name} IN DNSKEY {flags} 3 {} {} ;;state={} ;;since={}\n",
            u8::from(key.dnskey.algorithm()),
            BASE64.encode(&bytes),
            key.state.to_num(),
            key.since,
        ));
    }
    fs::write(&auto.path, out)?;
    Ok(())
}

fn key_bytes(dnskey: &DNSKEY) -> Option<Vec<u8>> {
    dnskey.key().ok().map(|key| key.public_bytes().to_vec())
}

/// Parse a master-file style anchor line into its owner name and record.
///
/// Accepted shapes: `name [ttl] [IN] DS keytag alg digesttype hexdigest`
/// and `name [ttl] [IN] DNSKEY flags proto alg base64key`.
pub fn parse_anchor_line(line: &str) -> Result<(Name, Record)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(ErrorKind::Anchor(format!("short anchor line: {line}")).into());
    }
    let mut name = Name::from_str(tokens[0])
        .map_err(|e| Error::from(ErrorKind::Anchor(format!("{}: {e}", tokens[0]))))?;
    name.set_fqdn(true);

    let mut idx = 1;
    // optional TTL and class tokens before the record type
    while idx < tokens.len()
        && (tokens[idx].chars().all(|c| c.is_ascii_digit()) || tokens[idx].eq_ignore_ascii_case("IN"))
    {
        idx += 1;
    }
    let rtype = tokens
        .get(idx)
        .ok_or_else(|| Error::from(ErrorKind::Anchor(format!("no record type: {line}"))))?;
    let fields = &tokens[idx + 1..];

    let (rtype, rdata) = if rtype.eq_ignore_ascii_case("DS") {
        (RecordType::DS, ds_rdata_wire(fields, line)?)
    } else if rtype.eq_ignore_ascii_case("DNSKEY") {
        (RecordType::DNSKEY, dnskey_rdata_wire(fields, line)?)
    } else {
        return Err(ErrorKind::Anchor(format!("unsupported anchor type: {line}")).into());
    };

    let record = record_from_wire(&name, rtype, &rdata)?;
    Ok((name, record))
}

fn ds_rdata_wire(fields: &[&str], line: &str) -> Result<Vec<u8>> {
    if fields.len() < 4 {
        return Err(ErrorKind::Anchor(format!("short DS rdata: {line}")).into());
    }
    let key_tag: u16 = fields[0]
        .parse()
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DS key tag: {line}"))))?;
    let algorithm: u8 = fields[1]
        .parse()
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DS algorithm: {line}"))))?;
    let digest_type: u8 = fields[2]
        .parse()
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DS digest type: {line}"))))?;
    let hex: String = fields[3..].concat();
    let digest = HEXUPPER_PERMISSIVE
        .decode(hex.as_bytes())
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DS digest: {line}"))))?;

    let mut wire = Vec::with_capacity(4 + digest.len());
    wire.extend_from_slice(&key_tag.to_be_bytes());
    wire.push(algorithm);
    wire.push(digest_type);
    wire.extend_from_slice(&digest);
    Ok(wire)
}

fn dnskey_rdata_wire(fields: &[&str], line: &str) -> Result<Vec<u8>> {
    if fields.len() < 4 {
        return Err(ErrorKind::Anchor(format!("short DNSKEY rdata: {line}")).into());
    }
    let flags: u16 = fields[0]
        .parse()
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DNSKEY flags: {line}"))))?;
    let proto: u8 = fields[1]
        .parse()
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DNSKEY protocol: {line}"))))?;
    let algorithm: u8 = fields[2]
        .parse()
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DNSKEY algorithm: {line}"))))?;
    let b64: String = fields[3..].concat();
    let key = BASE64
        .decode(b64.as_bytes())
        .or_else(|_| BASE64_NOPAD.decode(b64.as_bytes()))
        .map_err(|_| Error::from(ErrorKind::Anchor(format!("bad DNSKEY key data: {line}"))))?;

    let mut wire = Vec::with_capacity(4 + key.len());
    wire.extend_from_slice(&flags.to_be_bytes());
    wire.push(proto);
    wire.push(algorithm);
    wire.extend_from_slice(&key);
    Ok(wire)
}

/// Decode a record from its owner name, type and raw rdata by framing it as
/// a one-answer message, the same wire path every other record takes.
pub(crate) fn record_from_wire(name: &Name, rtype: RecordType, rdata: &[u8]) -> Result<Record> {
    let mut wire = Vec::with_capacity(12 + 64 + rdata.len());
    // header: id 0, QR|AA, one answer
    wire.extend_from_slice(&[0, 0, 0x84, 0x00, 0, 0, 0, 1, 0, 0, 0, 0]);
    for label in name.iter() {
        wire.push(label.len() as u8);
        wire.extend_from_slice(label);
    }
    wire.push(0);
    wire.extend_from_slice(&u16::from(rtype).to_be_bytes());
    wire.extend_from_slice(&1u16.to_be_bytes()); // class IN
    wire.extend_from_slice(&0u32.to_be_bytes()); // ttl
    wire.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    wire.extend_from_slice(rdata);

    let message = Message::from_vec(&wire)?;
    message
        .answers()
        .first()
        .cloned()
        .ok_or_else(|| ErrorKind::Anchor("record did not decode".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT_DS: &str =
        ". IN DS 20326 8 2 E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D";

    #[test]
    fn parses_ds_anchor_line() {
        let (name, record) = parse_anchor_line(ROOT_DS).unwrap();
        assert!(name.is_root());
        let ds = record.data().as_dnssec().unwrap().as_ds().unwrap();
        assert_eq!(ds.key_tag(), 20326);
        assert_eq!(ds.digest().len(), 32);
    }

    #[test]
    fn parses_dnskey_anchor_line() {
        // a syntactically valid key; 16 bytes of key material
        let line = "example.com. 3600 IN DNSKEY 257 3 8 AAECAwQFBgcICQoLDA0ODw==";
        let (name, record) = parse_anchor_line(line).unwrap();
        assert_eq!(name, Name::from_str("example.com.").unwrap());
        let dnskey = record.data().as_dnssec().unwrap().as_dnskey().unwrap();
        assert!(dnskey.zone_key());
        assert!(dnskey.secure_entry_point());
    }

    #[test]
    fn closest_ancestor_picks_most_specific() {
        let store = TrustAnchorStore::empty();
        store.add_anchor_line(ROOT_DS).unwrap();
        store
            .add_anchor_line(
                "example.com. IN DS 12345 8 2 E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D",
            )
            .unwrap();
        let anchor = store
            .closest_ancestor(&Name::from_str("www.example.com.").unwrap())
            .unwrap();
        assert_eq!(anchor, Name::from_str("example.com.").unwrap());
        let anchor = store
            .closest_ancestor(&Name::from_str("www.example.net.").unwrap())
            .unwrap();
        assert!(anchor.is_root());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_anchor_line("nonsense").is_err());
        assert!(parse_anchor_line("example.com. IN TXT \"hi\"").is_err());
        assert!(parse_anchor_line("example.com. IN DS 1 2").is_err());
    }
}
