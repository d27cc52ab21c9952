//! The DNSSEC validation module.
//!
//! Replies produced by the iterator pass through here before they reach the
//! client. The machine locates the trust anchor for the signer, walks the
//! DS → DNSKEY chain down to the signing zone (priming keys with
//! sub-queries as needed), verifies every RRSIG of the chased reply, and
//! checks NSEC/NSEC3 closure proofs on negative answers. The outcome is a
//! security status: secure, insecure, bogus or indeterminate.

pub mod anchors;
pub mod keys;
pub mod neg;
pub mod nsec;
pub mod nsec3;

pub use anchors::TrustAnchorStore;
pub use keys::{KeyCache, KeyEntry};

use hickory_proto::dnssec::{
    rdata::{DNSKEY, DS, NSEC, NSEC3, RRSIG},
    DigestType, Proof, Verifier,
};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RecordType};
use tracing::{debug, trace, warn};

use crate::module::{ModuleEnv, ModuleEvent, ModuleQState, ModuleState, QueryState, SubKind};
use crate::reply::{PackedRrset, QueryInfo, Reply, TrustLevel};

/// States of the validator machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValState {
    Init,
    FindKey,
    Validate,
    Finished,
}

/// Message classification for validation purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValClass {
    Positive,
    CnameNoAnswer,
    NoData,
    NxDomain,
    Any,
    Referral,
}

/// The sub-query the validator is waiting for.
#[derive(Clone, Debug)]
enum PendingSub {
    Ds(Name),
    Dnskey(Name),
    PrimeTa(Name),
}

/// Per-query state of the validator.
#[derive(Debug)]
pub struct ValQState {
    pub state: ValState,
    /// The reply being validated, taken from the iterator's output
    chase_reply: Option<Reply>,
    subtype: ValClass,
    /// The name whose records are being validated after CNAME traversal
    effective_qname: Name,
    signer: Option<Name>,
    anchor_name: Option<Name>,
    key_entry: Option<KeyEntry>,
    ds_rrset: Option<PackedRrset>,
    /// Deepest name proved to hold no zone cut during the chain walk
    empty_ds_name: Option<Name>,
    pending: Option<PendingSub>,
    /// Sub-query result delivered by `inform_super`
    sub_reply: Option<(QueryInfo, Option<Reply>, ResponseCode)>,
    pub wait_prime_ta: bool,
    outcome: Proof,
}

impl ValQState {
    fn new(qinfo: &QueryInfo) -> Self {
        Self {
            state: ValState::Init,
            chase_reply: None,
            subtype: ValClass::Any,
            effective_qname: qinfo.qname.clone(),
            signer: None,
            anchor_name: None,
            key_entry: None,
            ds_rrset: None,
            empty_ds_name: None,
            pending: None,
            sub_reply: None,
            wait_prime_ta: false,
            outcome: Proof::Indeterminate,
        }
    }
}

enum Step {
    Next(ValState),
    Suspend(ModuleState),
}

/// The validator module. Stateless; per-query data lives in [`ValQState`].
pub struct ValModule;

impl ValModule {
    pub fn operate(
        &self,
        qstate: &mut QueryState,
        event: ModuleEvent,
        env: &ModuleEnv,
    ) -> ModuleState {
        let mut vq = match std::mem::take(&mut qstate.minfo[1]) {
            ModuleQState::Val(vq) => *vq,
            ModuleQState::Empty => ValQState::new(&qstate.qinfo),
            other => {
                qstate.minfo[1] = other;
                warn!("validator entered with foreign module state");
                return ModuleState::Error;
            }
        };

        let state = match event {
            ModuleEvent::NewQuery | ModuleEvent::Pass => {
                if let Some(early) = self.skip_validation(qstate, &mut vq, env) {
                    early
                } else {
                    vq.chase_reply = qstate.return_msg.take();
                    vq.state = ValState::Init;
                    self.run(qstate, &mut vq, env)
                }
            }
            ModuleEvent::SubqueryDone => {
                match self.absorb_sub_result(qstate, &mut vq, env) {
                    Some(next) => {
                        vq.state = next;
                        self.run(qstate, &mut vq, env)
                    }
                    // a follow-up sub-query was dispatched instead
                    None => ModuleState::WaitSubquery,
                }
            }
            ModuleEvent::Error => ModuleState::Error,
            ModuleEvent::Reply | ModuleEvent::Timeout => {
                warn!("validator received a transport event");
                ModuleState::Error
            }
        };

        qstate.minfo[1] = ModuleQState::Val(Box::new(vq));
        state
    }

    /// Copy a finished key-fetch sub-query into the waiting parent.
    pub fn inform_super(&self, sub: &mut QueryState, superq: &mut QueryState, _env: &ModuleEnv) {
        let ModuleQState::Val(vq) = &mut superq.minfo[1] else {
            return;
        };
        vq.sub_reply = Some((
            sub.qinfo.clone(),
            sub.return_msg.clone(),
            sub.return_rcode,
        ));
    }

    /// Cases that bypass validation entirely.
    fn skip_validation(
        &self,
        qstate: &mut QueryState,
        vq: &mut ValQState,
        env: &ModuleEnv,
    ) -> Option<ModuleState> {
        if qstate.return_msg.is_none() {
            // the iterator failed; nothing to validate
            vq.state = ValState::Finished;
            return Some(ModuleState::Finished);
        }
        if env.anchors.is_empty() {
            return Some(ModuleState::Finished);
        }
        if qstate.flags.checking_disabled && !env.cfg.cfg.ignore_cd_flag {
            debug!(query = %qstate.qinfo, "checking disabled; not validating");
            return Some(ModuleState::Finished);
        }
        if env.cfg.is_domain_insecure(&qstate.qinfo.qname) {
            debug!(query = %qstate.qinfo, "domain-insecure; not validating");
            if let Some(reply) = qstate.return_msg.as_mut() {
                reply.security = Proof::Insecure;
            }
            return Some(ModuleState::Finished);
        }
        None
    }

    fn run(&self, qstate: &mut QueryState, vq: &mut ValQState, env: &ModuleEnv) -> ModuleState {
        loop {
            let step = match vq.state {
                ValState::Init => self.init(qstate, vq, env),
                ValState::FindKey => self.find_key(qstate, vq, env),
                ValState::Validate => self.validate(qstate, vq, env),
                ValState::Finished => return self.finished(qstate, vq, env),
            };
            match step {
                Step::Next(state) => vq.state = state,
                Step::Suspend(module_state) => return module_state,
            }
        }
    }

    fn init(&self, qstate: &mut QueryState, vq: &mut ValQState, env: &ModuleEnv) -> Step {
        let Some(reply) = vq.chase_reply.as_ref() else {
            vq.outcome = Proof::Indeterminate;
            return Step::Next(ValState::Finished);
        };

        vq.subtype = classify_reply(reply, &qstate.qinfo);
        vq.effective_qname = effective_qname(reply, &qstate.qinfo);
        vq.signer = find_signer(reply, vq.subtype, &vq.effective_qname);
        trace!(subtype = ?vq.subtype, signer = ?vq.signer, "validation begins");

        let anchor_target = vq.signer.clone().unwrap_or_else(|| vq.effective_qname.clone());
        vq.anchor_name = env.anchors.closest_ancestor(&anchor_target);
        let Some(anchor_name) = vq.anchor_name.clone() else {
            // no trust anchor covers this name; trust cannot be established
            vq.outcome = Proof::Indeterminate;
            return Step::Next(ValState::Finished);
        };

        if vq.signer.is_none() {
            // unsigned data inside the secured space: chase the chain to
            // the queried name itself; it ends either at an insecure
            // delegation or at a secure zone whose data should be signed
            debug!(query = %qstate.qinfo, "unsigned reply under trust anchor");
            vq.signer = Some(vq.effective_qname.clone());
        }

        // shortcut via cached keys, bounded below by the anchor point
        if let Some(entry) = env
            .key_cache
            .closest(vq.signer.as_ref().expect("signer set"), qstate.qinfo.qclass, qstate.now)
        {
            if anchor_name.zone_of(&entry.name) {
                vq.key_entry = Some(entry);
            }
        }
        Step::Next(ValState::FindKey)
    }

    /// One step of the chain walk from the trust anchor towards the signer.
    fn find_key(&self, qstate: &mut QueryState, vq: &mut ValQState, env: &ModuleEnv) -> Step {
        let signer = vq.signer.clone().expect("find_key requires a signer");
        let class = qstate.qinfo.qclass;

        let Some(entry) = vq.key_entry.clone() else {
            let anchor = vq.anchor_name.clone().expect("anchor set");
            // a DNSKEY answer for the anchor zone itself is checked against
            // the configured anchor material right here, never with another
            // DNSKEY fetch for the same zone
            if qstate.qinfo.qtype == RecordType::DNSKEY && qstate.qinfo.qname == anchor {
                return self.prime_from_anchor(qstate, vq, env, &anchor);
            }
            debug!(zone = %anchor, "priming trust anchor");
            vq.pending = Some(PendingSub::PrimeTa(anchor.clone()));
            vq.wait_prime_ta = true;
            qstate.attach_sub(QueryInfo::new(anchor, RecordType::DNSKEY), SubKind::Normal, 1);
            return Step::Suspend(ModuleState::WaitSubquery);
        };

        if entry.is_insecure() {
            vq.outcome = Proof::Insecure;
            return Step::Next(ValState::Finished);
        }
        if entry.is_null() {
            debug!(zone = %entry.name, "null key entry; validation fails");
            vq.outcome = Proof::Bogus;
            return Step::Next(ValState::Finished);
        }
        if entry.name == signer || vq.empty_ds_name.as_ref() == Some(&signer) {
            return Step::Next(ValState::Validate);
        }

        // move one zone cut closer to the signer, skipping names already
        // proved to hold no cut
        let base = match &vq.empty_ds_name {
            Some(name) if entry.name.zone_of(name) && signer != *name => name.clone(),
            _ => entry.name.clone(),
        };
        let child = next_chain_name(&base, &signer);

        if env.neg_cache.proves_no_ds(&child, qstate.now) {
            debug!(zone = %child, "ds denial served from negative cache");
            let insecure = KeyEntry::insecure(child, class, qstate.now + 3_600);
            env.key_cache.store(insecure.clone());
            vq.key_entry = Some(insecure);
            vq.outcome = Proof::Insecure;
            return Step::Next(ValState::Finished);
        }

        vq.pending = Some(PendingSub::Ds(child.clone()));
        qstate.attach_sub(QueryInfo::new(child, RecordType::DS), SubKind::Normal, 1);
        Step::Suspend(ModuleState::WaitSubquery)
    }

    /// Validate the chased DNSKEY RRset for an anchor zone directly against
    /// the configured DS or DNSKEY anchor material.
    fn prime_from_anchor(
        &self,
        qstate: &mut QueryState,
        vq: &mut ValQState,
        env: &ModuleEnv,
        anchor_name: &Name,
    ) -> Step {
        let class = qstate.qinfo.qclass;
        let result = vq.chase_reply.as_ref().and_then(|reply| {
            let dnskeys = reply.find_answer(anchor_name, RecordType::DNSKEY)?;
            let (ds, trusted_keys) = env.anchors.get(anchor_name)?.effective();
            verify_primed_keys(dnskeys, &ds, &trusted_keys, qstate.now, env)
        });
        match result {
            Some(validated) => {
                debug!(zone = %anchor_name, "trust anchor primed");
                let expire = validated.expire;
                env.anchors.probe(anchor_name, &validated, qstate.now, &env.cfg);
                let entry = KeyEntry::good(validated, expire);
                env.key_cache.store(entry.clone());
                vq.key_entry = Some(entry);
                Step::Next(ValState::FindKey)
            }
            None => {
                warn!(zone = %anchor_name, "trust anchor failed to prime");
                env.key_cache
                    .store(KeyEntry::null(anchor_name.clone(), class, qstate.now));
                vq.outcome = Proof::Bogus;
                Step::Next(ValState::Finished)
            }
        }
    }

    /// Digest a completed sub-query according to what was pending.
    fn absorb_sub_result(
        &self,
        qstate: &mut QueryState,
        vq: &mut ValQState,
        env: &ModuleEnv,
    ) -> Option<ValState> {
        let (sub_qinfo, sub_reply, _rcode) = vq.sub_reply.take()?;
        let pending = vq.pending.take()?;
        let class = qstate.qinfo.qclass;

        match pending {
            PendingSub::Ds(child) => {
                debug_assert_eq!(sub_qinfo.qtype, RecordType::DS);
                let Some(reply) = sub_reply else {
                    vq.outcome = Proof::Bogus;
                    return Some(ValState::Finished);
                };
                if let Some(ds) = reply.find_answer(&child, RecordType::DS) {
                    if reply.security != Proof::Secure {
                        vq.outcome = Proof::Bogus;
                        return Some(ValState::Finished);
                    }
                    // when this query IS the DNSKEY fetch for `child`, the
                    // chased set is verified against this DS on the spot
                    if qstate.qinfo.qtype == RecordType::DNSKEY
                        && qstate.qinfo.qname == child
                    {
                        let ds_records: Vec<DS> = ds
                            .rdatas
                            .iter()
                            .filter_map(|r| r.as_dnssec().and_then(|d| d.as_ds()).cloned())
                            .collect();
                        let validated = vq.chase_reply.as_ref().and_then(|chased| {
                            let dnskeys = chased.find_answer(&child, RecordType::DNSKEY)?;
                            verify_dnskeys_with_ds(dnskeys, &ds_records, qstate.now, env)
                        });
                        return match validated {
                            Some(validated) => {
                                let entry = KeyEntry::good(validated.clone(), validated.expire);
                                env.key_cache.store(entry.clone());
                                vq.key_entry = Some(entry);
                                Some(ValState::FindKey)
                            }
                            None => {
                                debug!(zone = %child, "dnskey set does not match its ds");
                                vq.outcome = Proof::Bogus;
                                Some(ValState::Finished)
                            }
                        };
                    }
                    vq.ds_rrset = Some(ds.clone());
                    vq.pending = Some(PendingSub::Dnskey(child.clone()));
                    qstate.attach_sub(
                        QueryInfo::new(child, RecordType::DNSKEY),
                        SubKind::Normal,
                        1,
                    );
                    vq.state = ValState::FindKey;
                    return None; // suspend until the DNSKEY arrives
                }
                match reply.security {
                    Proof::Insecure => {
                        // a validated denial of DS at a delegation: the
                        // chain ends insecurely
                        let expire = reply.min_expire(qstate.now + 3_600);
                        env.neg_cache.store_no_ds(child.clone(), expire);
                        let insecure = KeyEntry::insecure(child, class, expire);
                        env.key_cache.store(insecure.clone());
                        vq.key_entry = Some(insecure);
                        vq.outcome = Proof::Insecure;
                        Some(ValState::Finished)
                    }
                    Proof::Secure => {
                        // a validated denial with no delegation at this
                        // name; the walk continues with the same keys
                        vq.empty_ds_name = Some(child);
                        Some(ValState::FindKey)
                    }
                    _ => {
                        debug!(zone = %child, "ds fetch did not validate");
                        vq.outcome = Proof::Bogus;
                        Some(ValState::Finished)
                    }
                }
            }
            PendingSub::Dnskey(child) => {
                debug_assert_eq!(sub_qinfo.qtype, RecordType::DNSKEY);
                let ds = vq.ds_rrset.take();
                let Some(reply) = sub_reply else {
                    vq.outcome = Proof::Bogus;
                    return Some(ValState::Finished);
                };
                let Some(dnskeys) = reply.find_answer(&child, RecordType::DNSKEY) else {
                    vq.outcome = Proof::Bogus;
                    return Some(ValState::Finished);
                };
                let ds_records: Vec<DS> = ds
                    .iter()
                    .flat_map(|rrset| rrset.rdatas.iter())
                    .filter_map(|r| r.as_dnssec().and_then(|d| d.as_ds()).cloned())
                    .collect();
                match verify_dnskeys_with_ds(dnskeys, &ds_records, qstate.now, env) {
                    Some(validated) => {
                        let entry = KeyEntry::good(validated, dnskeys.expire);
                        env.key_cache.store(entry.clone());
                        vq.key_entry = Some(entry);
                        Some(ValState::FindKey)
                    }
                    None => {
                        debug!(zone = %child, "dnskey set does not match its ds");
                        vq.outcome = Proof::Bogus;
                        Some(ValState::Finished)
                    }
                }
            }
            PendingSub::PrimeTa(anchor_name) => {
                vq.wait_prime_ta = false;
                let anchor = env.anchors.get(&anchor_name);
                let result = sub_reply.as_ref().and_then(|reply| {
                    let dnskeys = reply.find_answer(&anchor_name, RecordType::DNSKEY)?;
                    let (ds, trusted_keys) = anchor.as_ref()?.effective();
                    verify_primed_keys(dnskeys, &ds, &trusted_keys, qstate.now, env)
                });
                match result {
                    Some(validated) => {
                        let expire = validated.expire;
                        env.anchors
                            .probe(&anchor_name, &validated, qstate.now, &env.cfg);
                        let entry = KeyEntry::good(validated, expire);
                        env.key_cache.store(entry.clone());
                        vq.key_entry = Some(entry);
                        Some(ValState::FindKey)
                    }
                    None => {
                        warn!(zone = %anchor_name, "trust anchor failed to prime");
                        env.key_cache
                            .store(KeyEntry::null(anchor_name, class, qstate.now));
                        vq.outcome = Proof::Bogus;
                        Some(ValState::Finished)
                    }
                }
            }
        }
    }

    /// Verify every RRset of the chased reply with the signer's keys.
    fn validate(&self, qstate: &mut QueryState, vq: &mut ValQState, env: &ModuleEnv) -> Step {
        let entry = vq.key_entry.clone().expect("validate requires keys");
        let Some(keys) = entry.dnskeys().cloned() else {
            vq.outcome = Proof::Bogus;
            return Step::Next(ValState::Finished);
        };
        let Some(mut reply) = vq.chase_reply.take() else {
            vq.outcome = Proof::Indeterminate;
            return Step::Next(ValState::Finished);
        };
        let now = qstate.now;

        let mut overall = Proof::Secure;
        for rrset in reply.answer.iter_mut().chain(reply.authority.iter_mut()) {
            let proof = verify_rrset(rrset, &keys, now, env);
            rrset.security = proof;
            if proof == Proof::Secure {
                rrset.trust = TrustLevel::Validated;
            } else {
                debug!(owner = %rrset.name, rtype = ?rrset.rtype, ?proof, "rrset failed validation");
                overall = overall.min(proof);
            }
        }

        if overall == Proof::Secure {
            if let Some(proof) =
                self.check_denial_and_wildcards(qstate, vq, env, &reply, &keys)
            {
                overall = overall.min(proof);
            }
        }

        if env.cfg.cfg.val_clean_additional {
            reply
                .additional
                .retain(|rrset| rrset.security == Proof::Secure || rrset.rrsigs.is_empty());
        }

        // key prefetch: re-prime the signer's keys shortly before they expire
        if env.cfg.cfg.prefetch_key {
            let remaining = entry.expire.saturating_sub(now);
            if remaining <= PREFETCH_KEY_WINDOW {
                qstate
                    .prefetch
                    .push(QueryInfo::new(entry.name.clone(), RecordType::DNSKEY));
            }
        }

        vq.outcome = overall;
        vq.chase_reply = Some(reply);
        Step::Next(ValState::Finished)
    }

    /// Negative answers need an NSEC/NSEC3 closure proof; wildcard
    /// expansions need a denial for the exact name.
    fn check_denial_and_wildcards(
        &self,
        qstate: &QueryState,
        vq: &ValQState,
        env: &ModuleEnv,
        reply: &Reply,
        keys: &PackedRrset,
    ) -> Option<Proof> {
        let needs_denial = matches!(
            vq.subtype,
            ValClass::NoData | ValClass::NxDomain | ValClass::CnameNoAnswer
        );
        let wildcard_expansion = reply
            .answer
            .iter()
            .any(|rrset| is_wildcard_expansion(rrset));
        if !needs_denial && !wildcard_expansion {
            return None;
        }

        let qinfo = QueryInfo {
            qname: vq.effective_qname.clone(),
            qtype: qstate.qinfo.qtype,
            qclass: qstate.qinfo.qclass,
        };
        let soa_name = reply
            .negative_soa()
            .map(|soa| soa.name.clone())
            .or_else(|| vq.signer.clone())?;

        let nsecs: Vec<(Name, NSEC)> = reply
            .authority
            .iter()
            .filter(|rrset| rrset.security == Proof::Secure)
            .flat_map(|rrset| {
                rrset.rdatas.iter().filter_map(|r| {
                    r.as_dnssec()
                        .and_then(|d| d.as_nsec())
                        .map(|nsec| (rrset.name.clone(), nsec.clone()))
                })
            })
            .collect();
        let nsec3s: Vec<(Name, NSEC3)> = reply
            .authority
            .iter()
            .filter(|rrset| rrset.security == Proof::Secure)
            .flat_map(|rrset| {
                rrset.rdatas.iter().filter_map(|r| {
                    r.as_dnssec()
                        .and_then(|d| d.as_nsec3())
                        .map(|nsec3| (rrset.name.clone(), nsec3.clone()))
                })
            })
            .collect();

        let proof = match (!nsec3s.is_empty(), !nsecs.is_empty()) {
            (true, true) => {
                warn!(query = %qinfo, "both nsec and nsec3 in one denial");
                Proof::Bogus
            }
            (true, false) => {
                let smallest_key = smallest_key_bits(keys).unwrap_or(0);
                let limit = env.cfg.nsec3_max_iterations(smallest_key);
                if nsec3::iterations_exceeded(&nsec3s, limit) {
                    // hashing this denial would be a DoS vector; treat the
                    // zone as unvalidatable rather than broken
                    debug!(query = %qinfo, "nsec3 iteration count above ceiling");
                    Proof::Insecure
                } else {
                    nsec3::verify_nsec3(&qinfo, &soa_name, reply.rcode, &nsec3s)
                }
            }
            (false, true) => nsec::verify_nsec(&qinfo, &soa_name, &nsecs),
            (false, false) => {
                debug!(query = %qinfo, "denial without nsec records");
                Proof::Bogus
            }
        };
        Some(proof)
    }

    fn finished(
        &self,
        qstate: &mut QueryState,
        vq: &mut ValQState,
        env: &ModuleEnv,
    ) -> ModuleState {
        let mut reply = match vq.chase_reply.take() {
            Some(reply) => reply,
            None => match qstate.return_msg.take() {
                Some(reply) => reply,
                None => {
                    qstate.return_msg = None;
                    return ModuleState::Finished;
                }
            },
        };
        reply.security = vq.outcome;

        match vq.outcome {
            Proof::Secure | Proof::Insecure => {
                // overwrite the unvalidated cache entry with the verdict
                env.msg_cache.store(
                    &qstate.qinfo,
                    &reply,
                    &env.rrset_cache,
                    qstate.now,
                    None,
                );
                qstate.return_msg = Some(reply);
                ModuleState::Finished
            }
            Proof::Bogus => {
                let expire = qstate.now + env.cfg.cfg.bogus_ttl;
                env.msg_cache.store(
                    &qstate.qinfo,
                    &reply,
                    &env.rrset_cache,
                    qstate.now,
                    Some(expire),
                );
                if env.cfg.cfg.val_permissive_mode {
                    debug!(query = %qstate.qinfo, "permissive mode passes bogus data");
                    reply.security = Proof::Indeterminate;
                    qstate.return_msg = Some(reply);
                    ModuleState::Finished
                } else {
                    qstate.return_rcode = ResponseCode::ServFail;
                    qstate.return_msg = None;
                    ModuleState::Error
                }
            }
            Proof::Indeterminate => {
                qstate.return_msg = Some(reply);
                ModuleState::Finished
            }
        }
    }
}

/// Classify a reply the way validation needs to see it.
pub fn classify_reply(reply: &Reply, qinfo: &QueryInfo) -> ValClass {
    if qinfo.qtype == RecordType::ANY {
        return ValClass::Any;
    }
    if reply.rcode == ResponseCode::NXDomain {
        return ValClass::NxDomain;
    }
    let has_answer = reply
        .answer
        .iter()
        .any(|rrset| rrset.rtype == qinfo.qtype);
    let has_cname = reply
        .answer
        .iter()
        .any(|rrset| rrset.rtype == RecordType::CNAME);
    if has_answer {
        ValClass::Positive
    } else if has_cname {
        ValClass::CnameNoAnswer
    } else if reply.answer.is_empty() && reply.negative_soa().is_none() && !reply.authority.is_empty()
    {
        ValClass::Referral
    } else {
        ValClass::NoData
    }
}

/// The name whose denial or answer is at stake after CNAME traversal.
fn effective_qname(reply: &Reply, qinfo: &QueryInfo) -> Name {
    let mut chase = qinfo.qname.clone();
    for _ in 0..=crate::iterator::MAX_RESTART_COUNT {
        let link = reply
            .answer
            .iter()
            .find(|rrset| rrset.rtype == RecordType::CNAME && rrset.name == chase)
            .and_then(|rrset| rrset.rdatas.first())
            .and_then(|r| r.as_cname());
        match link {
            Some(target) if target.0 != chase => chase = target.0.clone(),
            _ => break,
        }
    }
    chase
}

/// The signer name of the RRset being validated.
fn find_signer(reply: &Reply, subtype: ValClass, effective_qname: &Name) -> Option<Name> {
    let from_rrset = |rrset: &PackedRrset| {
        rrset
            .rrsigs
            .first()
            .map(|rrsig| rrsig.signer_name().clone())
    };
    match subtype {
        ValClass::Positive | ValClass::Any | ValClass::CnameNoAnswer => reply
            .answer
            .iter()
            .find(|rrset| rrset.name == *effective_qname || !rrset.rrsigs.is_empty())
            .and_then(from_rrset)
            .or_else(|| reply.authority.iter().find_map(from_rrset)),
        ValClass::NoData | ValClass::NxDomain | ValClass::Referral => {
            reply.authority.iter().find_map(from_rrset)
        }
    }
}

/// The next zone cut on the way from `current` down to `target`.
fn next_chain_name(current: &Name, target: &Name) -> Name {
    let mut child = target.clone();
    while child.base_name() != *current && !child.is_root() && child != *current {
        child = child.base_name();
    }
    child
}

/// A positive RRset synthesized from a wildcard has fewer RRSIG labels than
/// its owner name.
fn is_wildcard_expansion(rrset: &PackedRrset) -> bool {
    rrset.rrsigs.iter().any(|rrsig| {
        rrset.name.num_labels() > rrsig.num_labels() && !rrset.name.is_wildcard()
    })
}

fn smallest_key_bits(keys: &PackedRrset) -> Option<usize> {
    keys.rdatas
        .iter()
        .filter_map(|r| r.as_dnssec().and_then(|d| d.as_dnskey()))
        .filter_map(|dnskey| dnskey.key().ok())
        .map(|key| key.public_bytes().len() * 8)
        .min()
}

/// Verify one RRset against the zone keys. Secure if any RRSIG checks out.
fn verify_rrset(rrset: &PackedRrset, keys: &PackedRrset, now: u64, env: &ModuleEnv) -> Proof {
    if rrset.rrsigs.is_empty() {
        return if env.cfg.cfg.harden_dnssec_stripped {
            Proof::Bogus
        } else {
            Proof::Indeterminate
        };
    }
    for rrsig in &rrset.rrsigs {
        if check_sig_with_keys(rrset, rrsig, keys, now, env) {
            return Proof::Secure;
        }
    }
    Proof::Bogus
}

/// RFC 4035 §5.3 checks for one signature, then the cryptographic verify.
fn check_sig_with_keys(
    rrset: &PackedRrset,
    rrsig: &RRSIG,
    keys: &PackedRrset,
    now: u64,
    env: &ModuleEnv,
) -> bool {
    if rrsig.type_covered() != rrset.rtype {
        return false;
    }
    if *rrsig.signer_name() != keys.name {
        return false;
    }
    if rrsig.num_labels() > rrset.name.num_labels() {
        return false;
    }
    if !rrsig.algorithm().is_supported() {
        return false;
    }
    if !check_sig_times(rrsig, now, env) {
        return false;
    }

    let records = rrset.to_records(now);
    for dnskey in keys
        .rdatas
        .iter()
        .filter_map(|r| r.as_dnssec().and_then(|d| d.as_dnskey()))
    {
        if !dnskey.zone_key() || dnskey.revoke() {
            continue;
        }
        if dnskey.algorithm() != rrsig.algorithm() {
            continue;
        }
        match dnskey.calculate_key_tag() {
            Ok(tag) if tag == rrsig.key_tag() => {}
            _ => continue,
        }
        if dnskey
            .verify_rrsig(&rrset.name, rrset.class, rrsig, records.iter())
            .is_ok()
        {
            return true;
        }
    }
    false
}

/// Inception and expiration checks in serial-number arithmetic (RFC 1982),
/// with the configured clock skew allowances and any fixed date override.
fn check_sig_times(rrsig: &RRSIG, now: u64, env: &ModuleEnv) -> bool {
    let cfg = &env.cfg.cfg;
    let effective = if cfg.val_override_date != 0 {
        cfg.val_override_date
    } else {
        now
    };
    let now = effective as u32;
    let inception = rrsig.sig_inception().get();
    let expiration = rrsig.sig_expiration().get();
    serial_lte(inception, now.wrapping_add(cfg.val_sig_skew_min as u32))
        && serial_lte(now.wrapping_sub(cfg.val_sig_skew_max as u32), expiration)
}

/// `a <= b` under serial number arithmetic.
fn serial_lte(a: u32, b: u32) -> bool {
    a == b || (b.wrapping_sub(a) as i32) > 0
}

/// Verify a DNSKEY RRset against the DS set from its parent: a DS must
/// cover a key, and that key must self-sign the set.
fn verify_dnskeys_with_ds(
    dnskeys: &PackedRrset,
    ds_records: &[DS],
    now: u64,
    env: &ModuleEnv,
) -> Option<PackedRrset> {
    let keys: Vec<&DNSKEY> = dnskeys
        .rdatas
        .iter()
        .filter_map(|r| r.as_dnssec().and_then(|d| d.as_dnskey()))
        .collect();

    let mut matched = Vec::new();
    for ds in ds_records {
        if !ds.algorithm().is_supported() || matches!(ds.digest_type(), DigestType::Unknown(_)) {
            continue;
        }
        // count tag collisions so a flood of equal tags cannot buy digest
        // computations
        let mut attempts = 0;
        for key in &keys {
            if key.algorithm() != ds.algorithm() {
                continue;
            }
            match key.calculate_key_tag() {
                Ok(tag) if tag == ds.key_tag() => {}
                _ => continue,
            }
            attempts += 1;
            if attempts > MAX_KEY_TAG_COLLISIONS {
                warn!("too many key tag collisions; skipping remaining keys");
                break;
            }
            if ds.covers(&dnskeys.name, key).unwrap_or(false) {
                matched.push((*key).clone());
            }
        }
    }
    if matched.is_empty() {
        return None;
    }

    self_signed_keys(dnskeys, &matched, now, env)
}

/// Verify a primed anchor DNSKEY set against configured DS or DNSKEY
/// anchor material.
fn verify_primed_keys(
    dnskeys: &PackedRrset,
    anchor_ds: &[DS],
    anchor_keys: &[DNSKEY],
    now: u64,
    env: &ModuleEnv,
) -> Option<PackedRrset> {
    if !anchor_ds.is_empty() {
        if let Some(validated) = verify_dnskeys_with_ds(dnskeys, anchor_ds, now, env) {
            return Some(validated);
        }
    }
    let matched: Vec<DNSKEY> = dnskeys
        .rdatas
        .iter()
        .filter_map(|r| r.as_dnssec().and_then(|d| d.as_dnskey()))
        .filter(|key| anchor_keys.iter().any(|anchor| anchor == *key))
        .cloned()
        .collect();
    if matched.is_empty() {
        return None;
    }
    self_signed_keys(dnskeys, &matched, now, env)
}

/// The DNSKEY RRset must be signed by one of the already-trusted keys.
fn self_signed_keys(
    dnskeys: &PackedRrset,
    trusted: &[DNSKEY],
    now: u64,
    env: &ModuleEnv,
) -> Option<PackedRrset> {
    let records = dnskeys.to_records(now);
    for rrsig in &dnskeys.rrsigs {
        if !check_sig_times(rrsig, now, env) {
            continue;
        }
        if *rrsig.signer_name() != dnskeys.name {
            continue;
        }
        for key in trusted {
            if key.algorithm() != rrsig.algorithm() {
                continue;
            }
            match key.calculate_key_tag() {
                Ok(tag) if tag == rrsig.key_tag() => {}
                _ => continue,
            }
            if key
                .verify_rrsig(&dnskeys.name, dnskeys.class, rrsig, records.iter())
                .is_ok()
            {
                let mut validated = dnskeys.clone();
                validated.security = Proof::Secure;
                validated.trust = TrustLevel::Validated;
                return Some(validated);
            }
        }
    }
    None
}

/// Ceiling on same-tag keys tried per DS record.
const MAX_KEY_TAG_COLLISIONS: usize = 2;

/// Seconds before key expiry at which a re-prime is scheduled.
const PREFETCH_KEY_WINDOW: u64 = 600;

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::DNSClass;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn rrset(owner: &str, rtype: RecordType) -> PackedRrset {
        PackedRrset {
            name: name(owner),
            rtype,
            class: DNSClass::IN,
            flags: 0,
            expire: 1_000,
            rdatas: Vec::new(),
            rrsigs: Vec::new(),
            trust: TrustLevel::AnswerAa,
            security: Proof::Indeterminate,
            id: 0,
        }
    }

    #[test]
    fn classification_covers_the_shapes() {
        let qinfo = QueryInfo::new(name("www.example.com."), RecordType::A);

        let mut positive = Reply::empty(ResponseCode::NoError);
        positive.answer.push(rrset("www.example.com.", RecordType::A));
        assert_eq!(classify_reply(&positive, &qinfo), ValClass::Positive);

        let mut nxdomain = Reply::empty(ResponseCode::NXDomain);
        nxdomain.authority.push(rrset("example.com.", RecordType::SOA));
        assert_eq!(classify_reply(&nxdomain, &qinfo), ValClass::NxDomain);

        let mut nodata = Reply::empty(ResponseCode::NoError);
        nodata.authority.push(rrset("example.com.", RecordType::SOA));
        assert_eq!(classify_reply(&nodata, &qinfo), ValClass::NoData);

        let mut cname = Reply::empty(ResponseCode::NoError);
        cname.answer.push(rrset("www.example.com.", RecordType::CNAME));
        assert_eq!(classify_reply(&cname, &qinfo), ValClass::CnameNoAnswer);
    }

    #[test]
    fn chain_walk_descends_one_cut_at_a_time() {
        let next = next_chain_name(&Name::root(), &name("www.example.com."));
        assert_eq!(next, name("com."));
        let next = next_chain_name(&name("com."), &name("www.example.com."));
        assert_eq!(next, name("example.com."));
        let next = next_chain_name(&name("example.com."), &name("www.example.com."));
        assert_eq!(next, name("www.example.com."));
    }
}
