//! NSEC3 closure proofs.
//!
//! Hashed denial of existence per RFC 5155. Hashed names are compared in
//! their base32hex form, which preserves the ordering of the raw hashes.
//! The iteration ceiling is enforced before any hashing happens, so a
//! hostile response cannot buy CPU with an absurd iteration count.

use data_encoding::BASE32_DNSSEC;
use hickory_proto::dnssec::{rdata::NSEC3, Nsec3HashAlgorithm, Proof};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RecordType};
use tracing::debug;

use crate::reply::QueryInfo;

/// Check the iteration counts against the configured ceiling for the
/// smallest validating key. Called before any hash computation.
pub fn iterations_exceeded(nsec3s: &[(Name, NSEC3)], max_iterations: usize) -> bool {
    nsec3s
        .iter()
        .any(|(_, nsec3)| usize::from(nsec3.iterations()) > max_iterations)
}

struct HashedSet<'a> {
    records: Vec<(String, String, &'a NSEC3)>,
    salt: Vec<u8>,
    iterations: u16,
}

impl<'a> HashedSet<'a> {
    /// Extract (owner hash, next hash, rdata) triples for records that hash
    /// under the zone and share the parameters of the first record.
    fn new(soa_name: &Name, nsec3s: &'a [(Name, NSEC3)]) -> Option<Self> {
        let first = &nsec3s.first()?.1;
        if first.hash_algorithm() != Nsec3HashAlgorithm::SHA1 {
            return None;
        }
        let salt = first.salt().to_vec();
        let iterations = first.iterations();

        let mut records = Vec::with_capacity(nsec3s.len());
        for (owner, nsec3) in nsec3s {
            if nsec3.salt() != salt.as_slice() || nsec3.iterations() != iterations {
                continue;
            }
            // owner must look like <base32hash>.<zone>
            if owner.base_name() != *soa_name || owner.num_labels() == 0 {
                continue;
            }
            let owner_hash = match owner.iter().next() {
                Some(label) => String::from_utf8_lossy(label).to_lowercase(),
                None => continue,
            };
            let next_hash = BASE32_DNSSEC.encode(nsec3.next_hashed_owner_name());
            records.push((owner_hash, next_hash, nsec3));
        }
        if records.is_empty() {
            return None;
        }
        Some(Self {
            records,
            salt,
            iterations,
        })
    }

    fn hash(&self, name: &Name) -> Option<String> {
        let digest = Nsec3HashAlgorithm::SHA1
            .hash(&self.salt, name, self.iterations)
            .ok()?;
        Some(BASE32_DNSSEC.encode(digest.as_ref()))
    }

    fn matching(&self, hash: &str) -> Option<&NSEC3> {
        self.records
            .iter()
            .find(|(owner, _, _)| owner == hash)
            .map(|(_, _, nsec3)| *nsec3)
    }

    /// A record covers the hash when owner < hash < next, where a next
    /// value at or below the owner marks the wrap-around record.
    fn covering(&self, hash: &str) -> Option<&NSEC3> {
        self.records
            .iter()
            .find(|(owner, next, _)| {
                (owner.as_str() < hash && hash < next.as_str())
                    || (next <= owner && (hash > owner.as_str() || hash < next.as_str()))
            })
            .map(|(_, _, nsec3)| *nsec3)
    }
}

/// Verify an NSEC3 denial.
///
/// `Secure` means the denial is proven. A DS denial at a name carrying the
/// NS bit, or inside an opt-out span, proves an unsigned delegation and
/// yields `Insecure`; opt-out proofs of nonexistence are never better than
/// `Insecure` either. `Bogus` means the records do not close the denial.
pub fn verify_nsec3(
    qinfo: &QueryInfo,
    soa_name: &Name,
    rcode: ResponseCode,
    nsec3s: &[(Name, NSEC3)],
) -> Proof {
    let Some(set) = HashedSet::new(soa_name, nsec3s) else {
        debug!(query = %qinfo, "unusable nsec3 set");
        return Proof::Bogus;
    };

    let Some(qname_hash) = set.hash(&qinfo.qname) else {
        return Proof::Bogus;
    };

    if let Some(nsec3) = set.matching(&qname_hash) {
        // the name exists; the denial is about the type
        let types: Vec<RecordType> = nsec3.type_bit_maps().collect();
        if types.contains(&qinfo.qtype) || types.contains(&RecordType::CNAME) {
            return Proof::Bogus;
        }
        if qinfo.qtype == RecordType::DS {
            if types.contains(&RecordType::SOA) {
                // the child apex cannot answer for the parent side of a cut
                return Proof::Bogus;
            }
            if types.contains(&RecordType::NS) {
                // a delegation without DS: the child zone is unsigned
                return Proof::Insecure;
            }
            // no delegation at this name
            return Proof::Secure;
        }
        return Proof::Secure;
    }

    if rcode != ResponseCode::NXDomain && qinfo.qtype != RecordType::DS {
        // a NODATA answer must match the name directly
        return Proof::Bogus;
    }

    // closest-encloser proof: find the longest ancestor that exists, then
    // show the next-closer name is covered
    let mut closest = qinfo.qname.base_name();
    let closest_encloser = loop {
        if let Some(hash) = set.hash(&closest) {
            if set.matching(&hash).is_some() {
                break Some(closest.clone());
            }
        }
        if closest.is_root() || closest == *soa_name {
            break (closest == *soa_name).then_some(closest.clone());
        }
        closest = closest.base_name();
    };
    let Some(closest_encloser) = closest_encloser else {
        return Proof::Bogus;
    };

    // next closer: one more label of qname below the closest encloser
    let next_label_count = closest_encloser.num_labels() + 1;
    let mut next_closer = qinfo.qname.clone();
    while next_closer.num_labels() > next_label_count {
        next_closer = next_closer.base_name();
    }
    let Some(next_closer_hash) = set.hash(&next_closer) else {
        return Proof::Bogus;
    };
    let Some(cover) = set.covering(&next_closer_hash) else {
        return Proof::Bogus;
    };
    let opt_out = cover.opt_out();

    if qinfo.qtype == RecordType::DS {
        // an opt-out span admits unsigned delegations inside it; without
        // opt-out the covered next-closer shows there is no cut at all
        return if opt_out { Proof::Insecure } else { Proof::Secure };
    }

    // no wildcard may serve the name either
    let wildcard = closest_encloser.clone().into_wildcard();
    let Some(wildcard_hash) = set.hash(&wildcard) else {
        return Proof::Bogus;
    };
    if set.matching(&wildcard_hash).is_some() {
        return Proof::Bogus;
    }
    if set.covering(&wildcard_hash).is_none() {
        return Proof::Bogus;
    }

    if opt_out {
        // an opt-out span admits unsigned names inside it
        return Proof::Insecure;
    }
    Proof::Secure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::anchors::record_from_wire;
    use hickory_proto::rr::Record;
    use std::str::FromStr;

    const SALT: &[u8] = &[0xaa, 0xbb];
    const ITERATIONS: u16 = 5;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn hash_of(n: &str) -> String {
        BASE32_DNSSEC.encode(
            Nsec3HashAlgorithm::SHA1
                .hash(SALT, &name(n), ITERATIONS)
                .unwrap()
                .as_ref(),
        )
    }

    /// Build an NSEC3 record by wire form: hash-alg 1, flags, iterations,
    /// salt, next hashed owner, type bit map.
    fn nsec3(owner_hash: &str, next_hash: &str, opt_out: bool, types: &[RecordType]) -> (Name, NSEC3) {
        let mut rdata = vec![1u8, u8::from(opt_out)];
        rdata.extend_from_slice(&ITERATIONS.to_be_bytes());
        rdata.push(SALT.len() as u8);
        rdata.extend_from_slice(SALT);
        let next = BASE32_DNSSEC.decode(next_hash.as_bytes()).unwrap();
        rdata.push(next.len() as u8);
        rdata.extend_from_slice(&next);
        // type bit map, single window
        if !types.is_empty() {
            let mut bitmap = [0u8; 32];
            let mut max_octet = 0;
            for t in types {
                let v = u16::from(*t);
                assert!(v < 256, "test types stay in window zero");
                let octet = (v / 8) as usize;
                bitmap[octet] |= 0x80 >> (v % 8);
                max_octet = max_octet.max(octet);
            }
            rdata.push(0);
            rdata.push((max_octet + 1) as u8);
            rdata.extend_from_slice(&bitmap[..=max_octet]);
        }

        let owner = name(&format!("{owner_hash}.example.com."));
        let record: Record =
            record_from_wire(&owner, RecordType::NSEC3, &rdata).expect("nsec3 decodes");
        let nsec3 = record
            .data()
            .as_dnssec()
            .unwrap()
            .as_nsec3()
            .unwrap()
            .clone();
        (owner, nsec3)
    }

    /// An NSEC3 whose span covers `target`, built by perturbing the first
    /// character of the hash alphabet around it.
    fn covering_span(target: &str, opt_out: bool) -> (Name, NSEC3) {
        // "0...0" sorts before everything, "v...v" after everything
        let low = "0".repeat(target.len());
        let high = "v".repeat(target.len());
        assert!(low.as_str() < target && target < high.as_str());
        nsec3(&low, &high, opt_out, &[RecordType::A])
    }

    #[test]
    fn nodata_direct_match() {
        let qinfo = QueryInfo::new(name("a.example.com."), RecordType::AAAA);
        let records = vec![nsec3(&hash_of("a.example.com."), "0000000000", false, &[RecordType::A])];
        assert_eq!(
            verify_nsec3(&qinfo, &name("example.com."), ResponseCode::NoError, &records),
            Proof::Secure
        );
    }

    #[test]
    fn nodata_with_type_bit_is_bogus() {
        let qinfo = QueryInfo::new(name("a.example.com."), RecordType::A);
        let records = vec![nsec3(&hash_of("a.example.com."), "0000000000", false, &[RecordType::A])];
        assert_eq!(
            verify_nsec3(&qinfo, &name("example.com."), ResponseCode::NoError, &records),
            Proof::Bogus
        );
    }

    #[test]
    fn name_error_with_closest_encloser() {
        let qinfo = QueryInfo::new(name("b.a.example.com."), RecordType::A);
        let records = vec![
            // closest encloser a.example.com exists
            nsec3(&hash_of("a.example.com."), "0000000000", false, &[RecordType::A]),
            // spans covering the next closer name and the wildcard
            covering_span(&hash_of("b.a.example.com."), false),
        ];
        assert_eq!(
            verify_nsec3(&qinfo, &name("example.com."), ResponseCode::NXDomain, &records),
            Proof::Secure
        );
    }

    #[test]
    fn ds_denial_by_opt_out_cover_is_insecure() {
        let qinfo = QueryInfo::new(name("sub.example.com."), RecordType::DS);
        let records = vec![
            nsec3(&hash_of("example.com."), "0000000000", false, &[RecordType::SOA, RecordType::NS]),
            covering_span(&hash_of("sub.example.com."), true),
        ];
        assert_eq!(
            verify_nsec3(&qinfo, &name("example.com."), ResponseCode::NoError, &records),
            Proof::Insecure
        );
    }

    #[test]
    fn iteration_guard_fires_before_hashing() {
        let records = vec![nsec3(&hash_of("a.example.com."), "0000000000", false, &[])];
        assert!(!iterations_exceeded(&records, 150));
        assert!(iterations_exceeded(&records, 2));
    }

    #[test]
    fn unusable_set_is_bogus() {
        let qinfo = QueryInfo::new(name("a.example.com."), RecordType::A);
        assert_eq!(
            verify_nsec3(&qinfo, &name("example.com."), ResponseCode::NXDomain, &[]),
            Proof::Bogus
        );
    }
}
