//! The iterative resolution module.
//!
//! Resolution walks the delegation tree from the closest cached zone cut
//! (or a primed root) towards the queried name, following referrals and
//! CNAMEs, until a final answer or a terminal error. The walk is a state
//! machine advanced by worker events; every suspension point is a returned
//! [`ModuleState`].

pub mod response;

use std::net::SocketAddr;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RecordType};
use tracing::{debug, trace, warn};

use crate::delegation::{DelegationPoint, TargetState};
use crate::module::{
    ModuleEnv, ModuleEvent, ModuleQState, ModuleState, OutboundRequest, QueryState, SubKind,
};
use crate::reply::{PackedRrset, QueryInfo, Reply, TrustLevel};
use response::{classify, ResponseType};

/// Maximum number of query restarts; bounds the CNAME chain length.
pub const MAX_RESTART_COUNT: u32 = 8;
/// Maximum number of referrals followed for one query.
pub const MAX_REFERRAL_COUNT: u32 = 30;

/// States of the iterator machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterState {
    /// Fresh queries and query restarts begin here
    InitRequest,
    /// Stub-zone handling; priming responses re-enter here
    InitRequest2,
    /// Forward-zone handling
    InitRequest3,
    /// Iterate over nameserver targets of the delegation point
    QueryTargets,
    /// A response to an outbound query is being handled
    QueryResp,
    /// A priming response populates the caches
    PrimeResp,
    /// Terminal: the response is assembled
    Finished,
}

/// Per-query state of the iterator.
#[derive(Debug)]
pub struct IterQState {
    pub state: IterState,
    /// Where responses are routed once final; priming queries differ
    pub final_state: IterState,
    /// The query currently chased; diverges from the original after CNAMEs
    pub qchase: QueryInfo,
    pub dp: Option<DelegationPoint>,
    /// RRsets prepended to the answer section of the final response
    pub an_prepend: Vec<PackedRrset>,
    /// RRsets prepended to the authority section
    pub ns_prepend: Vec<PackedRrset>,
    pub query_restart_count: u32,
    pub referral_count: u32,
    /// Outstanding address sub-queries for NS targets
    pub num_target_queries: usize,
    /// A root or stub priming sub-query is outstanding
    pub wait_priming: bool,
    /// Priming ran and failed; do not prime again for this query
    pub prime_failed: bool,
    /// The stub for this query was already primed once
    pub primed_stub: bool,
    /// Address of the exchange in flight, for infra bookkeeping
    pub current_target: Option<SocketAddr>,
    /// The reply that FINISHED will hand to the next module
    pub response: Option<Reply>,
}

impl IterQState {
    pub fn new(qinfo: &QueryInfo) -> Self {
        Self {
            state: IterState::InitRequest,
            final_state: IterState::Finished,
            qchase: qinfo.clone(),
            dp: None,
            an_prepend: Vec::new(),
            ns_prepend: Vec::new(),
            query_restart_count: 0,
            referral_count: 0,
            num_target_queries: 0,
            wait_priming: false,
            prime_failed: false,
            primed_stub: false,
            current_target: None,
            response: None,
        }
    }

    /// State for a priming sub-query with its fixed delegation point.
    pub fn new_prime(qinfo: &QueryInfo, dp: DelegationPoint) -> Self {
        let mut iq = Self::new(qinfo);
        iq.final_state = IterState::PrimeResp;
        iq.dp = Some(dp);
        // the delegation point is preset; skip straight to target iteration
        iq.state = IterState::QueryTargets;
        iq
    }
}

enum Step {
    Next(IterState),
    Suspend(ModuleState),
}

/// The iterator module. Stateless; all per-query data lives in
/// [`IterQState`].
pub struct IterModule;

impl IterModule {
    pub fn operate(
        &self,
        qstate: &mut QueryState,
        event: ModuleEvent,
        env: &ModuleEnv,
    ) -> ModuleState {
        let mut iq = match std::mem::take(&mut qstate.minfo[0]) {
            ModuleQState::Iter(iq) => *iq,
            ModuleQState::Empty => IterQState::new(&qstate.qinfo),
            other => {
                qstate.minfo[0] = other;
                warn!("iterator entered with foreign module state");
                return ModuleState::Error;
            }
        };

        let prior = qstate.ext_state[0];
        let state = match event {
            ModuleEvent::NewQuery | ModuleEvent::Pass => self.run(qstate, &mut iq, env),
            ModuleEvent::Reply => {
                iq.state = IterState::QueryResp;
                self.run(qstate, &mut iq, env)
            }
            ModuleEvent::Timeout => {
                self.note_timeout(&mut iq, env, qstate.now);
                iq.state = IterState::QueryTargets;
                self.run(qstate, &mut iq, env)
            }
            ModuleEvent::SubqueryDone => {
                if prior == ModuleState::WaitReply {
                    // an exchange is still in flight; the merged results are
                    // picked up on the next visit to QUERYTARGETS
                    ModuleState::WaitReply
                } else {
                    self.run(qstate, &mut iq, env)
                }
            }
            ModuleEvent::Error => ModuleState::Error,
        };

        qstate.minfo[0] = ModuleQState::Iter(Box::new(iq));
        state
    }

    /// Merge a finished sub-query into a waiting parent.
    pub fn inform_super(&self, sub: &mut QueryState, superq: &mut QueryState, env: &ModuleEnv) {
        let sub_is_prime = matches!(
            &sub.minfo[0],
            ModuleQState::Iter(iq) if iq.final_state == IterState::PrimeResp
        );
        let ModuleQState::Iter(piq) = &mut superq.minfo[0] else {
            return;
        };

        if sub_is_prime {
            piq.wait_priming = false;
            if sub.return_msg.is_none() {
                piq.prime_failed = true;
            }
            // any priming results are in the caches now; restart the walk
            piq.state = IterState::InitRequest;
            return;
        }

        match sub.qinfo.qtype {
            RecordType::A | RecordType::AAAA => {
                piq.num_target_queries = piq.num_target_queries.saturating_sub(1);
                if let Some(dp) = &mut piq.dp {
                    dp.mark_queried(&sub.qinfo.qname, sub.qinfo.qtype);
                    dp.merge_cached_addresses(&env.rrset_cache, superq.now);
                }
            }
            _ => {
                // referral-path checks and other advisory sub-queries carry
                // no state back
            }
        }
    }

    fn run(&self, qstate: &mut QueryState, iq: &mut IterQState, env: &ModuleEnv) -> ModuleState {
        loop {
            let step = match iq.state {
                IterState::InitRequest => self.init_request(qstate, iq, env),
                IterState::InitRequest2 => self.init_request2(qstate, iq, env),
                IterState::InitRequest3 => self.init_request3(qstate, iq, env),
                IterState::QueryTargets => self.query_targets(qstate, iq, env),
                IterState::QueryResp => self.query_resp(qstate, iq, env),
                IterState::PrimeResp => self.prime_resp(qstate, iq, env),
                IterState::Finished => return self.finished(qstate, iq),
            };
            match step {
                Step::Next(state) => iq.state = state,
                Step::Suspend(module_state) => return module_state,
            }
        }
    }

    fn init_request(&self, qstate: &mut QueryState, iq: &mut IterQState, env: &ModuleEnv) -> Step {
        trace!(query = %iq.qchase, "resolving");
        if iq.query_restart_count > MAX_RESTART_COUNT {
            warn!(query = %qstate.qinfo, "restart budget exceeded");
            return self.error_response(qstate, iq);
        }

        if !qstate.bypass_cache {
            if let Some(hit) = env.msg_cache.lookup(&iq.qchase, &env.rrset_cache, qstate.now) {
                debug!(query = %iq.qchase, "answered from message cache");
                if hit.wants_prefetch && env.cfg.cfg.prefetch {
                    qstate.prefetch.push(iq.qchase.clone());
                }
                if hit.reply.security == hickory_proto::dnssec::Proof::Bogus {
                    if !env.cfg.cfg.val_permissive_mode {
                        return self.error_response(qstate, iq);
                    }
                    let mut reply = hit.reply;
                    reply.security = hickory_proto::dnssec::Proof::Indeterminate;
                    iq.response = Some(reply);
                    return Step::Next(iq.final_state);
                }
                // a cached partial chain restarts the chase at its target
                if !matches!(iq.qchase.qtype, RecordType::CNAME | RecordType::ANY) {
                    let (links, chased) = collect_cname_chain(&hit.reply, &iq.qchase.qname);
                    if !links.is_empty()
                        && chased != iq.qchase.qname
                        && hit.reply.find_answer(&chased, iq.qchase.qtype).is_none()
                    {
                        iq.an_prepend.extend(links);
                        iq.qchase.qname = chased;
                        iq.query_restart_count += 1;
                        iq.dp = None;
                        return Step::Next(IterState::InitRequest);
                    }
                }
                iq.response = Some(hit.reply);
                return Step::Next(iq.final_state);
            }

            if env.cfg.cfg.harden_below_nxdomain {
                if let Some(reply) = self.cached_ancestor_nxdomain(qstate, iq, env) {
                    iq.response = Some(reply);
                    return Step::Next(iq.final_state);
                }
            }
        }

        // locate the closest enclosing cached NS set
        iq.dp = self.closest_delegation(&iq.qchase.qname, env, qstate.now);

        if iq.dp.is_none() && env.cfg.forwarders_for(&iq.qchase.qname).is_none() {
            if iq.prime_failed {
                debug!("root priming failed; cannot resolve");
                return self.error_response(qstate, iq);
            }
            // no starting point at all; prime the root
            let root = QueryInfo::new(Name::root(), RecordType::NS);
            let hints = DelegationPoint::from_addrs(Name::root(), &env.cfg.root_hint_addrs);
            qstate.attach_sub(root, SubKind::Prime(hints), 0);
            iq.wait_priming = true;
            debug!("priming the root");
            return Step::Suspend(ModuleState::WaitSubquery);
        }
        Step::Next(IterState::InitRequest2)
    }

    fn init_request2(&self, qstate: &mut QueryState, iq: &mut IterQState, env: &ModuleEnv) -> Step {
        // deepest stub zone below the current delegation point wins
        let stub = deepest_stub(&iq.qchase.qname, iq.dp.as_ref().map(|dp| &dp.name), env);
        if let Some((zone, addrs)) = stub {
            let cached = env
                .rrset_cache
                .get(&zone, RecordType::NS, iq.qchase.qclass, 0, qstate.now);
            match cached {
                Some(ns_rrset) => {
                    let mut dp =
                        DelegationPoint::from_ns_rrset(&ns_rrset, &env.rrset_cache, qstate.now);
                    dp.is_stub = true;
                    // fall back to the configured addresses when no glue is known
                    if dp.targets.is_empty() {
                        for addr in &addrs {
                            dp.add_target(zone.clone(), *addr);
                        }
                    }
                    iq.dp = Some(dp);
                }
                None if !iq.primed_stub => {
                    iq.primed_stub = true;
                    let mut hints = DelegationPoint::from_addrs(zone.clone(), &addrs);
                    hints.is_stub = true;
                    qstate.attach_sub(
                        QueryInfo::new(zone, RecordType::NS),
                        SubKind::Prime(hints),
                        0,
                    );
                    iq.wait_priming = true;
                    return Step::Suspend(ModuleState::WaitSubquery);
                }
                None => {
                    // priming failed earlier; query the fixed addresses
                    let mut dp = DelegationPoint::from_addrs(zone, &addrs);
                    dp.is_stub = true;
                    iq.dp = Some(dp);
                }
            }
        }
        Step::Next(IterState::InitRequest3)
    }

    fn init_request3(&self, _qstate: &mut QueryState, iq: &mut IterQState, env: &ModuleEnv) -> Step {
        if let Some((zone, addrs)) = env.cfg.forwarders_for(&iq.qchase.qname) {
            let deeper = match &iq.dp {
                Some(dp) => zone.num_labels() >= dp.name.num_labels() || dp.is_forward,
                None => true,
            };
            if deeper {
                let mut dp = DelegationPoint::from_addrs(zone.clone(), addrs);
                dp.is_forward = true;
                iq.dp = Some(dp);
            }
        }
        Step::Next(IterState::QueryTargets)
    }

    fn query_targets(&self, qstate: &mut QueryState, iq: &mut IterQState, env: &ModuleEnv) -> Step {
        if iq.referral_count > MAX_REFERRAL_COUNT {
            warn!(query = %qstate.qinfo, "referral budget exceeded");
            return self.error_response(qstate, iq);
        }
        let now = qstate.now;
        let depth = qstate.depth;
        let Some(dp) = iq.dp.as_mut() else {
            return self.error_response(qstate, iq);
        };

        // fire sub-queries for missing NS addresses, per the fetch policy
        if depth < env.cfg.max_dependency_depth() {
            let missing = dp.missing_targets();
            let policy = env.cfg.fetch_count_at_depth(depth);
            let to_fetch = match policy {
                p if p < 0 => missing.len(),
                0 if dp.usable_target_count() == 0 => missing.len(),
                0 => 0,
                p => missing.len().min(p as usize),
            };
            for (name, rtype) in missing.into_iter().take(to_fetch) {
                trace!(ns = %name, ?rtype, "fetching target address");
                dp.mark_queried(&name, rtype);
                qstate.attach_sub(QueryInfo::new(name, rtype), SubKind::Normal, 0);
                iq.num_target_queries += 1;
            }
        }

        if let Some(addr) = dp.select_target(iq.qchase.qtype, &env.infra, &env.cfg, now) {
            iq.current_target = Some(addr);
            let zone = dp.name.clone();
            let recursive = dp.is_forward;
            qstate.outbound = Some(OutboundRequest {
                qinfo: iq.qchase.clone(),
                target: addr,
                zone: zone.clone(),
                dnssec: !env.anchors.is_empty() || qstate.flags.dnssec_ok,
                recursion_desired: recursive,
                timeout_ms: env.infra.rto_ms(&zone, addr.ip(), now),
            });
            return Step::Suspend(ModuleState::WaitReply);
        }

        if iq.num_target_queries > 0 {
            // no target usable yet, but addresses are on the way
            return Step::Suspend(ModuleState::WaitSubquery);
        }

        if !dp.targets.is_empty()
            && dp
                .targets
                .iter()
                .all(|t| env.cfg.is_denied_server(t.addr.ip()))
        {
            // every server for this query is on the do-not-query list
            qstate.return_rcode = ResponseCode::Refused;
        }
        debug!(query = %iq.qchase, zone = %dp.name, "all targets exhausted");
        self.error_response(qstate, iq)
    }

    fn query_resp(&self, qstate: &mut QueryState, iq: &mut IterQState, env: &ModuleEnv) -> Step {
        let Some(message) = qstate.response.take() else {
            return self.error_response(qstate, iq);
        };
        let target = iq.current_target.take();
        let zone = iq
            .dp
            .as_ref()
            .map(|dp| dp.name.clone())
            .unwrap_or_else(Name::root);

        match classify(&message, &iq.qchase) {
            ResponseType::Answer => {
                if let Some(addr) = target {
                    if let Some(dp) = iq.dp.as_mut() {
                        dp.mark(addr, TargetState::ProbedGood);
                    }
                }
                let mut reply = Reply::from_message(&message, qstate.now);
                clamp_reply_ttls(&mut reply, env, qstate.now);
                env.msg_cache
                    .store(&iq.qchase, &reply, &env.rrset_cache, qstate.now, None);
                iq.response = Some(reply);
                Step::Next(iq.final_state)
            }
            ResponseType::Cname => self.handle_cname(qstate, iq, env, &message),
            ResponseType::Referral => self.handle_referral(qstate, iq, env, &message, target),
            ResponseType::NxDomain | ResponseType::NoData => {
                if let Some(addr) = target {
                    if let Some(dp) = iq.dp.as_mut() {
                        dp.mark(addr, TargetState::ProbedGood);
                    }
                }
                let mut reply = Reply::from_message(&message, qstate.now);
                clamp_reply_ttls(&mut reply, env, qstate.now);
                env.msg_cache
                    .store(&iq.qchase, &reply, &env.rrset_cache, qstate.now, None);
                iq.response = Some(reply);
                Step::Next(iq.final_state)
            }
            ResponseType::Lame => {
                debug!(%zone, ?target, "lame response");
                if let Some(addr) = target {
                    env.infra
                        .record_lame(&zone, addr.ip(), iq.qchase.qtype, qstate.now);
                    if let Some(dp) = iq.dp.as_mut() {
                        dp.mark(addr, TargetState::ProbedBad);
                    }
                }
                Step::Next(IterState::QueryTargets)
            }
            ResponseType::Throwaway => {
                debug!(%zone, ?target, "throwaway response");
                if let Some(addr) = target {
                    env.infra.record_failure(&zone, addr.ip(), qstate.now);
                    if let Some(dp) = iq.dp.as_mut() {
                        dp.mark(addr, TargetState::ProbedBad);
                    }
                }
                Step::Next(IterState::QueryTargets)
            }
        }
    }

    fn handle_cname(
        &self,
        qstate: &mut QueryState,
        iq: &mut IterQState,
        env: &ModuleEnv,
        message: &hickory_proto::op::Message,
    ) -> Step {
        let mut reply = Reply::from_message(message, qstate.now);
        clamp_reply_ttls(&mut reply, env, qstate.now);
        // cache the partial answer under the name that elicited it
        env.msg_cache
            .store(&iq.qchase, &reply, &env.rrset_cache, qstate.now, None);

        let (links, chase) = collect_cname_chain(&reply, &iq.qchase.qname);
        iq.an_prepend.extend(links);

        debug!(from = %iq.qchase.qname, to = %chase, "following cname");
        iq.qchase.qname = chase;
        iq.query_restart_count += 1;
        iq.dp = None;
        Step::Next(IterState::InitRequest)
    }

    fn handle_referral(
        &self,
        qstate: &mut QueryState,
        iq: &mut IterQState,
        env: &ModuleEnv,
        message: &hickory_proto::op::Message,
        target: Option<SocketAddr>,
    ) -> Step {
        let now = qstate.now;
        let mut reply = Reply::from_message(message, now);
        clamp_reply_ttls(&mut reply, env, now);

        let current_zone = iq
            .dp
            .as_ref()
            .map(|dp| dp.name.clone())
            .unwrap_or_else(Name::root);

        let ns_rrset = reply
            .authority
            .iter()
            .find(|rrset| rrset.rtype == RecordType::NS)
            .cloned();
        let Some(ns_rrset) = ns_rrset else {
            return self.throwaway(qstate, iq, env, target, &current_zone);
        };
        let new_zone = ns_rrset.name.clone();

        // loop protection: the delegation must move strictly downward and
        // stay above the chased name
        let strictly_below = current_zone.zone_of(&new_zone) && new_zone != current_zone;
        let covers_qname = new_zone.zone_of(&iq.qchase.qname);
        if !strictly_below || !covers_qname {
            debug!(%new_zone, %current_zone, "referral does not descend; ignoring");
            return self.throwaway(qstate, iq, env, target, &current_zone);
        }

        if let Some(addr) = target {
            if let Some(dp) = iq.dp.as_mut() {
                dp.mark(addr, TargetState::ProbedGood);
            }
        }

        // cache the NS set and its usable glue
        let stored_ns = env.rrset_cache.update(ns_rrset.clone(), now);
        let mut dp = DelegationPoint::new(new_zone.clone());
        for rdata in &stored_ns.rdatas {
            if let Some(ns) = rdata.as_ns() {
                dp.add_nameserver(ns.0.clone());
            }
        }
        for glue in &reply.additional {
            if !matches!(glue.rtype, RecordType::A | RecordType::AAAA) {
                continue;
            }
            if env.cfg.cfg.harden_glue && !new_zone.zone_of(&glue.name) {
                debug!(owner = %glue.name, zone = %new_zone, "out-of-bailiwick glue dropped");
                continue;
            }
            let stored = env.rrset_cache.update(glue.clone(), now);
            dp.merge_address_rrset(&stored);
        }
        dp.merge_cached_addresses(&env.rrset_cache, now);

        if env.cfg.cfg.harden_referral_path {
            // advisory validation of the NS set on the referral path
            qstate.attach_sub(
                QueryInfo::new(new_zone.clone(), RecordType::NS),
                SubKind::Normal,
                0,
            );
        }

        debug!(zone = %new_zone, targets = dp.targets.len(), "following referral");
        iq.referral_count += 1;
        iq.dp = Some(dp);
        Step::Next(IterState::QueryTargets)
    }

    fn prime_resp(&self, qstate: &mut QueryState, iq: &mut IterQState, env: &ModuleEnv) -> Step {
        // the answer rrsets were stored on the way in; raise the NS set so a
        // later delegation lookup finds it
        if let Some(reply) = &iq.response {
            for rrset in reply.iter() {
                if rrset.rtype == RecordType::NS && rrset.name == iq.qchase.qname {
                    let mut promoted = rrset.clone();
                    promoted.trust = TrustLevel::AnswerAa;
                    env.rrset_cache.update(promoted, qstate.now);
                }
            }
        }
        debug!(zone = %iq.qchase.qname, "priming finished");
        Step::Next(IterState::Finished)
    }

    fn finished(&self, qstate: &mut QueryState, iq: &mut IterQState) -> ModuleState {
        let mut reply = iq
            .response
            .take()
            .unwrap_or_else(|| Reply::empty(ResponseCode::ServFail));
        if !iq.an_prepend.is_empty() {
            let mut answer = std::mem::take(&mut iq.an_prepend);
            answer.extend(reply.answer.drain(..));
            reply.answer = answer;
        }
        if !iq.ns_prepend.is_empty() {
            let mut authority = std::mem::take(&mut iq.ns_prepend);
            authority.extend(reply.authority.drain(..));
            reply.authority = authority;
        }
        qstate.return_rcode = reply.rcode;
        qstate.return_msg = Some(reply);
        ModuleState::Finished
    }

    /// Terminal failure. A partial CNAME chain already collected is returned
    /// alongside the SERVFAIL indicator; otherwise the error is bare.
    fn error_response(&self, qstate: &mut QueryState, iq: &mut IterQState) -> Step {
        if qstate.return_rcode == ResponseCode::NoError {
            qstate.return_rcode = ResponseCode::ServFail;
        }
        if !iq.an_prepend.is_empty() {
            let mut reply = Reply::empty(ResponseCode::ServFail);
            reply.answer = std::mem::take(&mut iq.an_prepend);
            qstate.return_msg = Some(reply);
            iq.state = IterState::Finished;
            return Step::Suspend(ModuleState::Finished);
        }
        qstate.return_msg = None;
        iq.state = IterState::Finished;
        Step::Suspend(ModuleState::Error)
    }

    fn throwaway(
        &self,
        qstate: &mut QueryState,
        iq: &mut IterQState,
        env: &ModuleEnv,
        target: Option<SocketAddr>,
        zone: &Name,
    ) -> Step {
        if let Some(addr) = target {
            env.infra.record_failure(zone, addr.ip(), qstate.now);
            if let Some(dp) = iq.dp.as_mut() {
                dp.mark(addr, TargetState::ProbedBad);
            }
        }
        Step::Next(IterState::QueryTargets)
    }

    fn note_timeout(&self, iq: &mut IterQState, env: &ModuleEnv, now: u64) {
        if let (Some(addr), Some(dp)) = (iq.current_target.take(), iq.dp.as_mut()) {
            debug!(%addr, zone = %dp.name, "upstream timeout");
            env.infra.record_failure(&dp.name, addr.ip(), now);
            // the target stays eligible for its remaining tries
            dp.mark(addr, TargetState::Unused);
        }
    }

    /// The closest enclosing NS set in the RRset cache, as a delegation
    /// point with any cached addresses merged in.
    fn closest_delegation(&self, qname: &Name, env: &ModuleEnv, now: u64) -> Option<DelegationPoint> {
        let mut name = qname.clone();
        loop {
            if let Some(ns) = env
                .rrset_cache
                .get(&name, RecordType::NS, hickory_proto::rr::DNSClass::IN, 0, now)
            {
                let dp = DelegationPoint::from_ns_rrset(&ns, &env.rrset_cache, now);
                return Some(dp);
            }
            if name.is_root() {
                return None;
            }
            name = name.base_name();
        }
    }

    /// RFC 8020: a validated cached NXDOMAIN at an ancestor answers the
    /// sub-name without a query.
    fn cached_ancestor_nxdomain(
        &self,
        qstate: &QueryState,
        iq: &IterQState,
        env: &ModuleEnv,
    ) -> Option<Reply> {
        let mut name = iq.qchase.qname.base_name();
        while !name.is_root() {
            let ancestor = QueryInfo::new(name.clone(), iq.qchase.qtype);
            if let Some(hit) = env.msg_cache.lookup(&ancestor, &env.rrset_cache, qstate.now) {
                if hit.reply.rcode == ResponseCode::NXDomain
                    && hit.reply.security == hickory_proto::dnssec::Proof::Secure
                {
                    debug!(%name, "answering from ancestor nxdomain");
                    return Some(hit.reply);
                }
            }
            name = name.base_name();
        }
        None
    }
}

/// Walk the CNAME links of a reply from `start`, returning the links in
/// chain order and the final target. The hop bound forecloses looped
/// chains within one message.
fn collect_cname_chain(reply: &Reply, start: &Name) -> (Vec<PackedRrset>, Name) {
    let mut links = Vec::new();
    let mut chase = start.clone();
    for _ in 0..reply.answer.len() {
        let link = reply
            .answer
            .iter()
            .find(|rrset| rrset.rtype == RecordType::CNAME && rrset.name == chase)
            .cloned();
        let Some(link) = link else { break };
        let Some(next) = link.rdatas.first().and_then(|r| r.as_cname()) else {
            break;
        };
        let next = next.0.clone();
        links.push(link);
        if next == chase {
            break;
        }
        chase = next;
    }
    (links, chase)
}

/// Apply the configured TTL bounds before anything is cached.
fn clamp_reply_ttls(reply: &mut Reply, env: &ModuleEnv, now: u64) {
    let min = env.cfg.cfg.cache_min_ttl;
    let max = env.cfg.cfg.cache_max_ttl;
    for rrset in reply.iter_mut() {
        let ttl = rrset.expire.saturating_sub(now).clamp(min, max);
        rrset.expire = now + ttl;
    }
}

/// The deepest configured stub zone enclosing `qname` that lies below the
/// current delegation point.
fn deepest_stub(
    qname: &Name,
    dp_name: Option<&Name>,
    env: &ModuleEnv,
) -> Option<(Name, Vec<SocketAddr>)> {
    let mut best: Option<(Name, Vec<SocketAddr>)> = None;
    for (zone, addrs) in &env.cfg.stub_zones {
        if !zone.zone_of(qname) {
            continue;
        }
        if let Some(dp_name) = dp_name {
            if zone.num_labels() < dp_name.num_labels() {
                continue;
            }
        }
        let deeper = match &best {
            Some((current, _)) => zone.num_labels() > current.num_labels(),
            None => true,
        };
        if deeper {
            best = Some((zone.clone(), addrs.clone()));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RuntimeConfig};
    use crate::module::QueryFlags;
    use crate::validator::TrustAnchorStore;
    use hickory_proto::rr::{rdata::A, DNSClass, RData};
    use std::str::FromStr;
    use std::sync::Arc;

    fn env() -> ModuleEnv {
        let cfg = Arc::new(RuntimeConfig::from_config(Config::default()).unwrap());
        ModuleEnv::new(cfg, Arc::new(TrustAnchorStore::empty()))
    }

    fn qstate(qname: &str, qtype: RecordType, now: u64) -> QueryState {
        QueryState::new(
            1,
            QueryInfo::new(Name::from_str(qname).unwrap(), qtype),
            QueryFlags {
                recursion_desired: true,
                ..QueryFlags::default()
            },
            2,
            now,
        )
    }

    #[test]
    fn empty_cache_primes_the_root() {
        let env = env();
        let mut qstate = qstate("www.example.com.", RecordType::A, 100);
        let state = IterModule.operate(&mut qstate, ModuleEvent::NewQuery, &env);
        assert_eq!(state, ModuleState::WaitSubquery);
        assert_eq!(qstate.subs.len(), 1);
        assert!(matches!(qstate.subs[0].kind, SubKind::Prime(_)));
        assert_eq!(qstate.subs[0].qinfo.qname, Name::root());
    }

    #[test]
    fn cache_hit_finishes_without_outbound() {
        let env = env();
        let qinfo = QueryInfo::new(Name::from_str("www.example.com.").unwrap(), RecordType::A);
        let mut reply = Reply::empty(ResponseCode::NoError);
        reply.authoritative = true;
        reply.answer.push(PackedRrset {
            name: qinfo.qname.clone(),
            rtype: RecordType::A,
            class: DNSClass::IN,
            flags: 0,
            expire: 1_000,
            rdatas: vec![RData::A(A::new(192, 0, 2, 1))],
            rrsigs: Vec::new(),
            trust: TrustLevel::AnswerAa,
            security: hickory_proto::dnssec::Proof::Indeterminate,
            id: 0,
        });
        env.msg_cache.store(&qinfo, &reply, &env.rrset_cache, 100, None);

        let mut qstate = qstate("www.example.com.", RecordType::A, 200);
        let state = IterModule.operate(&mut qstate, ModuleEvent::NewQuery, &env);
        assert_eq!(state, ModuleState::Finished);
        let out = qstate.return_msg.unwrap();
        assert_eq!(out.answer.len(), 1);
        assert!(qstate.outbound.is_none());
    }

    #[test]
    fn cached_delegation_emits_outbound_query() {
        let env = env();
        let now = 100;
        // a cached NS set with glue for example.com.
        let zone = Name::from_str("example.com.").unwrap();
        let ns_name = Name::from_str("ns1.example.com.").unwrap();
        env.rrset_cache.update(
            PackedRrset {
                name: zone.clone(),
                rtype: RecordType::NS,
                class: DNSClass::IN,
                flags: 0,
                expire: now + 3_600,
                rdatas: vec![RData::NS(hickory_proto::rr::rdata::NS(ns_name.clone()))],
                rrsigs: Vec::new(),
                trust: TrustLevel::Authority,
                security: hickory_proto::dnssec::Proof::Indeterminate,
                id: 0,
            },
            now,
        );
        env.rrset_cache.update(
            PackedRrset {
                name: ns_name,
                rtype: RecordType::A,
                class: DNSClass::IN,
                flags: 0,
                expire: now + 3_600,
                rdatas: vec![RData::A(A::new(192, 0, 2, 53))],
                rrsigs: Vec::new(),
                trust: TrustLevel::AdditionalAddr,
                security: hickory_proto::dnssec::Proof::Indeterminate,
                id: 0,
            },
            now,
        );

        let mut qstate = qstate("www.example.com.", RecordType::A, now);
        let state = IterModule.operate(&mut qstate, ModuleEvent::NewQuery, &env);
        assert_eq!(state, ModuleState::WaitReply);
        let outbound = qstate.outbound.as_ref().unwrap();
        assert_eq!(outbound.target.ip(), "192.0.2.53".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(outbound.zone, Name::from_str("example.com.").unwrap());
    }

    #[test]
    fn forward_zone_overrides_delegation() {
        let config = Config::from_toml(
            r#"
            [[forward-zone]]
            name = "corp.example."
            forward-addr = ["10.1.2.3:53"]
            "#,
        )
        .unwrap();
        let cfg = Arc::new(RuntimeConfig::from_config(config).unwrap());
        let env = ModuleEnv::new(cfg, Arc::new(TrustAnchorStore::empty()));

        let mut qstate = qstate("host.corp.example.", RecordType::A, 100);
        let state = IterModule.operate(&mut qstate, ModuleEvent::NewQuery, &env);
        assert_eq!(state, ModuleState::WaitReply);
        let outbound = qstate.outbound.as_ref().unwrap();
        assert_eq!(outbound.target, "10.1.2.3:53".parse().unwrap());
        assert!(outbound.recursion_desired);
    }

    #[test]
    fn restart_budget_is_fatal() {
        let env = env();
        let mut qstate = qstate("www.example.com.", RecordType::A, 100);
        let mut iq = IterQState::new(&qstate.qinfo);
        iq.query_restart_count = MAX_RESTART_COUNT + 1;
        qstate.minfo[0] = ModuleQState::Iter(Box::new(iq));
        let state = IterModule.operate(&mut qstate, ModuleEvent::Pass, &env);
        assert_eq!(state, ModuleState::Error);
        assert_eq!(qstate.return_rcode, ResponseCode::ServFail);
    }
}
