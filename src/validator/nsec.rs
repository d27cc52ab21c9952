//! NSEC closure proofs for negative answers.
//!
//! The records handed in here have already had their signatures validated
//! individually; what is proved is that the *set* of NSEC records actually
//! denies the queried name or type. Name comparisons use the canonical DNS
//! ordering that `Name` implements.

use hickory_proto::dnssec::{rdata::NSEC, Proof};
use hickory_proto::rr::{Name, RecordType};

use crate::reply::QueryInfo;

/// Verify an NSEC denial for a query, given the SOA owner of the zone the
/// denial comes from.
///
/// A proven denial is `Secure`, with one exception: a DS denial at a name
/// that carries the NS bit is a delegation without DS, which proves the
/// child zone `Insecure`. A DS denial anywhere else (no NS bit, or a
/// nonexistent name) just shows there is no zone cut there. A failed proof
/// is `Bogus`.
pub fn verify_nsec(qinfo: &QueryInfo, soa_name: &Name, nsecs: &[(Name, NSEC)]) -> Proof {
    // direct match: the name exists, the type must not
    if let Some((_, nsec)) = nsecs.iter().find(|(name, _)| qinfo.qname == *name) {
        let types: Vec<RecordType> = nsec.type_bit_maps().collect();
        if types.contains(&qinfo.qtype) {
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
            // no delegation at this name at all
            return Proof::Secure;
        }
        return Proof::Secure;
    }

    let covered = |name: &Name| {
        nsecs.iter().any(|(owner, nsec)| {
            name >= owner && (name < nsec.next_domain_name() || nsec.next_domain_name() < owner)
        })
    };

    if !covered(&qinfo.qname) {
        return Proof::Bogus;
    }

    // no wildcard may exist either; the covering proof for the source of
    // synthesis closes the denial
    let wildcard = qinfo.qname.base_name();
    let wildcard = if soa_name.zone_of(&wildcard) {
        wildcard
    } else {
        soa_name.clone()
    };
    if wildcard == qinfo.qname || covered(&wildcard) {
        Proof::Secure
    } else {
        Proof::Bogus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn nsec(owner: &str, next: &str, types: &[RecordType]) -> (Name, NSEC) {
        (name(owner), NSEC::new(name(next), types.to_vec()))
    }

    #[test]
    fn nodata_direct_match_without_type_bit() {
        let qinfo = QueryInfo::new(name("a.example.com."), RecordType::AAAA);
        let nsecs = vec![nsec(
            "a.example.com.",
            "b.example.com.",
            &[RecordType::A, RecordType::NSEC],
        )];
        assert_eq!(
            verify_nsec(&qinfo, &name("example.com."), &nsecs),
            Proof::Secure
        );
    }

    #[test]
    fn direct_match_with_type_bit_is_bogus() {
        let qinfo = QueryInfo::new(name("a.example.com."), RecordType::A);
        let nsecs = vec![nsec(
            "a.example.com.",
            "b.example.com.",
            &[RecordType::A],
        )];
        assert_eq!(
            verify_nsec(&qinfo, &name("example.com."), &nsecs),
            Proof::Bogus
        );
    }

    #[test]
    fn name_error_needs_cover_and_wildcard_denial() {
        let qinfo = QueryInfo::new(name("m.example.com."), RecordType::A);
        // covers m.example.com and the wildcard source *.example.com
        let nsecs = vec![
            nsec("example.com.", "z.example.com.", &[RecordType::SOA]),
        ];
        assert_eq!(
            verify_nsec(&qinfo, &name("example.com."), &nsecs),
            Proof::Secure
        );
    }

    #[test]
    fn missing_cover_is_bogus() {
        let qinfo = QueryInfo::new(name("m.example.com."), RecordType::A);
        let nsecs = vec![nsec("n.example.com.", "p.example.com.", &[RecordType::A])];
        assert_eq!(
            verify_nsec(&qinfo, &name("example.com."), &nsecs),
            Proof::Bogus
        );
    }

    #[test]
    fn last_nsec_wraps_the_zone() {
        let qinfo = QueryInfo::new(name("zz.example.com."), RecordType::A);
        // next name sorts before the owner, so the record wraps
        let nsecs = vec![
            nsec("z.example.com.", "example.com.", &[RecordType::A]),
            nsec("example.com.", "z.example.com.", &[RecordType::SOA]),
        ];
        assert_eq!(
            verify_nsec(&qinfo, &name("example.com."), &nsecs),
            Proof::Secure
        );
    }

    #[test]
    fn ds_denial_at_delegation_is_insecure() {
        let qinfo = QueryInfo::new(name("sub.example.com."), RecordType::DS);
        let nsecs = vec![nsec(
            "sub.example.com.",
            "zz.example.com.",
            &[RecordType::NS],
        )];
        assert_eq!(
            verify_nsec(&qinfo, &name("example.com."), &nsecs),
            Proof::Insecure
        );
    }

    #[test]
    fn ds_denial_without_delegation_is_secure() {
        // no NS bit: the name exists but is not a zone cut
        let qinfo = QueryInfo::new(name("host.example.com."), RecordType::DS);
        let nsecs = vec![nsec(
            "host.example.com.",
            "zz.example.com.",
            &[RecordType::A, RecordType::AAAA],
        )];
        assert_eq!(
            verify_nsec(&qinfo, &name("example.com."), &nsecs),
            Proof::Secure
        );
    }
}
