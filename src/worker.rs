//! The per-thread dispatch engine.
//!
//! A worker owns the queries of one thread: it runs each query through the
//! module pipeline, spawns and de-duplicates sub-queries, fans sub-query
//! completions out to every waiting parent, enforces the jostle policy
//! under load, and converts terminal module states into DNS responses.
//!
//! The engine is synchronous and event-driven; the surrounding server loop
//! performs the actual socket I/O and feeds results back in. That keeps
//! every resolution path exercisable without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::dnssec::Proof;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, ResponseCode};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::iterator::IterQState;
use crate::module::{
    ModuleEnv, ModuleEvent, ModuleQState, ModuleState, OutboundRequest, Pipeline, QueryFlags,
    QueryState, SubKind, SubRequest,
};
use crate::reply::QueryInfo;

/// Where a client query came from and how to answer it.
#[derive(Clone, Debug)]
pub enum ClientHandle {
    Udp {
        addr: SocketAddr,
        /// Index of the listening socket the query arrived on, so the
        /// reply leaves with the right source address
        socket: usize,
    },
    Tcp {
        conn: u64,
    },
}

/// Per-client-query reply context.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub handle: ClientHandle,
    /// Message id to echo
    pub id: u16,
    pub recursion_desired: bool,
    pub checking_disabled: bool,
    pub dnssec_ok: bool,
    /// Client sent EDNS; include one in the reply
    pub want_edns: bool,
    /// Negotiated maximum UDP payload
    pub max_udp: u16,
    /// Arrival time in milliseconds, for the jostle policy
    pub started_ms: u64,
}

/// A finished reply ready to be written to the wire.
pub struct CompletedResponse {
    pub client: ClientHandle,
    pub message: Message,
}

type SubFingerprint = (QueryInfo, bool);

/// The dispatch engine for one worker thread.
pub struct Worker {
    env: Arc<ModuleEnv>,
    pipeline: Pipeline,
    queries: HashMap<u64, QueryState>,
    clients: HashMap<u64, ClientInfo>,
    /// sub id → (parent id, initiating module index)
    parents: HashMap<u64, Vec<(u64, usize)>>,
    sub_index: HashMap<SubFingerprint, u64>,
    /// (query, target) pairs with an exchange in flight
    outstanding: HashSet<(QueryInfo, SocketAddr)>,
    inflight_key: HashMap<u64, (QueryInfo, SocketAddr)>,
    waiting_outbound: Vec<(u64, OutboundRequest)>,
    pending_outbound: Vec<(u64, OutboundRequest)>,
    responses: Vec<CompletedResponse>,
    events: VecDeque<(u64, ModuleEvent)>,
    next_id: u64,
    now: u64,
}

impl Worker {
    pub fn new(env: Arc<ModuleEnv>) -> Self {
        Self {
            env,
            pipeline: Pipeline::new(),
            queries: HashMap::new(),
            clients: HashMap::new(),
            parents: HashMap::new(),
            sub_index: HashMap::new(),
            outstanding: HashSet::new(),
            inflight_key: HashMap::new(),
            waiting_outbound: Vec::new(),
            pending_outbound: Vec::new(),
            responses: Vec::new(),
            events: VecDeque::new(),
            next_id: 1,
            now: 0,
        }
    }

    pub fn env(&self) -> &ModuleEnv {
        &self.env
    }

    pub fn active_queries(&self) -> usize {
        self.queries.len()
    }

    /// Outbound exchanges the I/O layer should start now.
    pub fn take_outbound(&mut self) -> Vec<(u64, OutboundRequest)> {
        std::mem::take(&mut self.pending_outbound)
    }

    /// Finished responses ready for the wire.
    pub fn take_responses(&mut self) -> Vec<CompletedResponse> {
        std::mem::take(&mut self.responses)
    }

    /// Accept a client query from the front end.
    pub fn handle_client_query(
        &mut self,
        message: &Message,
        handle: ClientHandle,
        now: u64,
        now_ms: u64,
    ) {
        self.now = now;
        let header = message.header();
        if header.message_type() != MessageType::Query {
            return; // not a query; drop silently
        }
        if header.op_code() != OpCode::Query {
            self.respond_error(&handle, message, ResponseCode::NotImp);
            return;
        }
        let Some(query) = message.queries().first() else {
            self.respond_error(&handle, message, ResponseCode::FormErr);
            return;
        };
        if !header.recursion_desired() {
            // this is a resolver, not an authority
            self.respond_error(&handle, message, ResponseCode::Refused);
            return;
        }

        if self.queries.len() >= self.env.cfg.cfg.num_queries_per_thread
            && !self.jostle(now_ms)
        {
            debug!("worker saturated; refusing new query");
            self.respond_error(&handle, message, ResponseCode::ServFail);
            return;
        }

        let edns = message.extensions().as_ref();
        let dnssec_ok = edns.map(|e| e.flags().dnssec_ok).unwrap_or(false);
        let max_udp = edns
            .map(|e| e.max_payload().clamp(512, self.env.cfg.cfg.max_udp_size))
            .unwrap_or(512);

        let qinfo = QueryInfo::from_query(query);
        let flags = QueryFlags {
            recursion_desired: true,
            checking_disabled: header.checking_disabled(),
            dnssec_ok,
        };

        let qid = self.next_id;
        self.next_id += 1;
        let qstate = QueryState::new(qid, qinfo, flags, self.pipeline.len(), now);
        self.clients.insert(
            qid,
            ClientInfo {
                handle,
                id: message.id(),
                recursion_desired: header.recursion_desired(),
                checking_disabled: header.checking_disabled(),
                dnssec_ok,
                want_edns: edns.is_some(),
                max_udp,
                started_ms: now_ms,
            },
        );
        self.queries.insert(qid, qstate);
        self.events.push_back((qid, ModuleEvent::NewQuery));
        self.pump();
    }

    /// Deliver the result of an outbound exchange.
    pub fn handle_outbound_result(
        &mut self,
        qid: u64,
        result: Result<Message, Error>,
        rtt_ms: Option<u32>,
        now: u64,
    ) {
        self.now = now;
        if let Some(key) = self.inflight_key.remove(&qid) {
            self.outstanding.remove(&key);
            self.release_waiting(&key);
        }
        let Some(qstate) = self.queries.get_mut(&qid) else {
            return;
        };
        match result {
            Ok(message) => {
                if let (Some(rtt), Some(req)) = (rtt_ms, qstate_outbound_zone(qstate)) {
                    self.env.infra.record_rtt(&req.0, req.1.ip(), rtt, now);
                }
                qstate.response = Some(message);
                self.events.push_back((qid, ModuleEvent::Reply));
            }
            Err(e) if e.is_transient() => {
                trace!(qid, "outbound timed out");
                self.events.push_back((qid, ModuleEvent::Timeout));
            }
            Err(e) => {
                debug!(qid, "outbound failed: {e}");
                self.events.push_back((qid, ModuleEvent::Timeout));
            }
        }
        self.pump();
    }

    /// Drain the event queue, running each query until it suspends.
    fn pump(&mut self) {
        while let Some((qid, event)) = self.events.pop_front() {
            self.dispatch(qid, event);
        }
    }

    fn dispatch(&mut self, qid: u64, event: ModuleEvent) {
        let Some(mut qstate) = self.queries.remove(&qid) else {
            return;
        };
        qstate.now = self.now;

        let mut event = event;
        let finished = loop {
            let curmod = qstate.curmod;
            let state = self.pipeline.modules[curmod].operate(&mut qstate, event, &self.env);
            qstate.ext_state[curmod] = state;

            let outbound = qstate.outbound.take();
            let subs = std::mem::take(&mut qstate.subs);
            let prefetch = std::mem::take(&mut qstate.prefetch);
            if !subs.is_empty() {
                self.spawn_subs(qid, &mut qstate, subs);
            }
            if !prefetch.is_empty() {
                self.spawn_prefetches(prefetch);
            }

            match state {
                ModuleState::Finished => {
                    if curmod + 1 < self.pipeline.len() {
                        qstate.curmod += 1;
                        event = ModuleEvent::Pass;
                        continue;
                    }
                    break true;
                }
                ModuleState::Error => {
                    if qstate.return_rcode == ResponseCode::NoError {
                        qstate.return_rcode = ResponseCode::ServFail;
                    }
                    break true;
                }
                ModuleState::WaitReply => {
                    if let Some(request) = outbound {
                        self.queue_outbound(qid, request);
                    }
                    break false;
                }
                ModuleState::WaitSubquery => break false,
                ModuleState::WaitModule => {
                    if curmod + 1 < self.pipeline.len() {
                        qstate.curmod += 1;
                        event = ModuleEvent::Pass;
                        continue;
                    }
                    break false;
                }
            }
        };

        if finished {
            self.finish_query(qid, qstate);
        } else {
            self.queries.insert(qid, qstate);
        }
    }

    /// Spawn requested sub-queries, attaching to an existing one when the
    /// same resolution is already in flight.
    fn spawn_subs(&mut self, parent_id: u64, parent: &mut QueryState, subs: Vec<SubRequest>) {
        for sub in subs {
            let prime = matches!(sub.kind, SubKind::Prime(_));
            let fingerprint = (sub.qinfo.clone(), prime);

            if let Some(&existing) = self.sub_index.get(&fingerprint) {
                if self.is_ancestor_of(parent_id, existing) {
                    warn!(query = %sub.qinfo, "dependency cycle; failing the requester");
                    self.events.push_back((parent_id, ModuleEvent::Error));
                    continue;
                }
                trace!(query = %sub.qinfo, "attaching to in-flight sub-query");
                self.parents
                    .entry(existing)
                    .or_default()
                    .push((parent_id, sub.initiator));
                continue;
            }

            let qid = self.next_id;
            self.next_id += 1;
            let mut qstate = QueryState::new(
                qid,
                sub.qinfo.clone(),
                QueryFlags {
                    recursion_desired: true,
                    ..QueryFlags::default()
                },
                self.pipeline.len(),
                self.now,
            );
            qstate.depth = parent.depth + 1;
            qstate.bypass_cache = sub.bypass_cache;
            if let SubKind::Prime(dp) = sub.kind {
                qstate.minfo[0] =
                    ModuleQState::Iter(Box::new(IterQState::new_prime(&sub.qinfo, dp)));
            }

            self.sub_index.insert(fingerprint, qid);
            self.parents
                .entry(qid)
                .or_default()
                .push((parent_id, sub.initiator));
            self.queries.insert(qid, qstate);
            self.events.push_back((qid, ModuleEvent::NewQuery));
        }
    }

    /// Background refresh queries: full pipeline, no parent, cache bypassed.
    fn spawn_prefetches(&mut self, list: Vec<QueryInfo>) {
        for qinfo in list {
            let fingerprint = (qinfo.clone(), false);
            if self.sub_index.contains_key(&fingerprint) {
                continue;
            }
            debug!(query = %qinfo, "prefetching");
            let qid = self.next_id;
            self.next_id += 1;
            let mut qstate = QueryState::new(
                qid,
                qinfo,
                QueryFlags {
                    recursion_desired: true,
                    ..QueryFlags::default()
                },
                self.pipeline.len(),
                self.now,
            );
            qstate.bypass_cache = true;
            self.sub_index.insert(fingerprint, qid);
            self.queries.insert(qid, qstate);
            self.events.push_back((qid, ModuleEvent::NewQuery));
        }
    }

    /// Walk the parent links of `candidate`; true if `qid` is reachable.
    fn is_ancestor_of(&self, qid: u64, candidate: u64) -> bool {
        let mut stack = vec![candidate];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == qid {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(links) = self.parents.get(&current) {
                stack.extend(links.iter().map(|(parent, _)| *parent));
            }
        }
        false
    }

    fn queue_outbound(&mut self, qid: u64, request: OutboundRequest) {
        let key = (request.qinfo.clone(), request.target);
        if self.outstanding.contains(&key) {
            trace!(query = %request.qinfo, "exchange already in flight; parking");
            self.waiting_outbound.push((qid, request));
            return;
        }
        self.outstanding.insert(key.clone());
        self.inflight_key.insert(qid, key);
        self.pending_outbound.push((qid, request));
    }

    fn release_waiting(&mut self, key: &(QueryInfo, SocketAddr)) {
        let mut rest = Vec::new();
        let mut promoted = Vec::new();
        for (qid, request) in self.waiting_outbound.drain(..) {
            if (&request.qinfo, &request.target) == (&key.0, &key.1) && promoted.is_empty() {
                promoted.push((qid, request));
            } else {
                rest.push((qid, request));
            }
        }
        self.waiting_outbound = rest;
        for (qid, request) in promoted {
            self.queue_outbound(qid, request);
        }
    }

    /// Displace the oldest long-running client query to make room. True if
    /// a slot was freed.
    fn jostle(&mut self, now_ms: u64) -> bool {
        let timeout = self.env.cfg.cfg.jostle_timeout;
        let victim = self
            .clients
            .iter()
            .filter(|(_, c)| now_ms.saturating_sub(c.started_ms) > timeout)
            .min_by_key(|(_, c)| c.started_ms)
            .map(|(id, _)| *id);
        let Some(victim) = victim else {
            return false;
        };
        debug!(qid = victim, "jostling out old query");
        if let Some(mut qstate) = self.queries.remove(&victim) {
            qstate.return_msg = None;
            qstate.return_rcode = ResponseCode::ServFail;
            self.finish_query(victim, qstate);
        }
        true
    }

    /// A query ran to completion: answer the client and wake the parents.
    fn finish_query(&mut self, qid: u64, mut qstate: QueryState) {
        self.sub_index.retain(|_, id| *id != qid);
        if let Some(key) = self.inflight_key.remove(&qid) {
            self.outstanding.remove(&key);
            self.release_waiting(&key);
        }

        if let Some(client) = self.clients.remove(&qid) {
            let message = self.render_response(&client, &qstate);
            self.responses.push(CompletedResponse {
                client: client.handle,
                message,
            });
        }

        if let Some(links) = self.parents.remove(&qid) {
            for (parent_id, initiator) in links {
                let Some(mut parent) = self.queries.remove(&parent_id) else {
                    continue;
                };
                self.pipeline.modules[initiator].inform_super(&mut qstate, &mut parent, &self.env);
                self.queries.insert(parent_id, parent);
                self.events.push_back((parent_id, ModuleEvent::SubqueryDone));
            }
        }
    }

    /// Render the terminal state of a query into a wire response.
    fn render_response(&self, client: &ClientInfo, qstate: &QueryState) -> Message {
        let mut message = match &qstate.return_msg {
            Some(reply) => {
                let mut message =
                    reply.to_message(client.id, &qstate.qinfo, qstate.now, client.dnssec_ok);
                if reply.security == Proof::Secure && client.dnssec_ok {
                    message.set_authentic_data(true);
                }
                message
            }
            None => {
                let mut message = Message::new();
                message
                    .set_id(client.id)
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_desired(client.recursion_desired)
                    .set_recursion_available(true)
                    .set_response_code(qstate.return_rcode);
                message.add_query(qstate.qinfo.to_query());
                message
            }
        };
        message.set_checking_disabled(client.checking_disabled);

        if client.want_edns {
            let mut edns = Edns::new();
            edns.set_max_payload(self.env.cfg.cfg.edns_buffer_size);
            edns.set_version(0);
            edns.set_dnssec_ok(client.dnssec_ok);
            *message.extensions_mut() = Some(edns);
        }

        if let ClientHandle::Udp { .. } = client.handle {
            if let Ok(wire) = message.to_vec() {
                if wire.len() > usize::from(client.max_udp) {
                    // too big for the negotiated size: truncate to a header
                    message.set_truncated(true);
                    message.take_answers();
                    message.take_name_servers();
                    message.take_additionals();
                }
            }
        }
        message
    }

    fn respond_error(&mut self, handle: &ClientHandle, request: &Message, rcode: ResponseCode) {
        let mut message = Message::new();
        message
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_available(true)
            .set_recursion_desired(request.header().recursion_desired())
            .set_response_code(rcode);
        if let Some(query) = request.queries().first() {
            message.add_query(query.clone());
        }
        self.responses.push(CompletedResponse {
            client: handle.clone(),
            message,
        });
    }
}

/// The zone and target of the exchange a query is waiting on.
fn qstate_outbound_zone(qstate: &QueryState) -> Option<(hickory_proto::rr::Name, SocketAddr)> {
    match &qstate.minfo[0] {
        ModuleQState::Iter(iq) => {
            let addr = iq.current_target?;
            let zone = iq.dp.as_ref()?.name.clone();
            Some((zone, addr))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RuntimeConfig};
    use crate::validator::TrustAnchorStore;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn worker() -> Worker {
        let cfg = Arc::new(RuntimeConfig::from_config(Config::default()).unwrap());
        let env = Arc::new(ModuleEnv::new(cfg, Arc::new(TrustAnchorStore::empty())));
        Worker::new(env)
    }

    fn client_query(qname: &str, rd: bool) -> Message {
        let mut message = Message::new();
        message
            .set_id(99)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(rd);
        message.add_query(Query::query(Name::from_str(qname).unwrap(), RecordType::A));
        message
    }

    fn udp() -> ClientHandle {
        ClientHandle::Udp {
            addr: "198.51.100.7:5353".parse().unwrap(),
            socket: 0,
        }
    }

    #[test]
    fn non_recursive_query_is_refused() {
        let mut worker = worker();
        worker.handle_client_query(&client_query("example.com.", false), udp(), 100, 100_000);
        let responses = worker.take_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message.response_code(), ResponseCode::Refused);
    }

    #[test]
    fn query_with_empty_cache_starts_root_prime() {
        let mut worker = worker();
        worker.handle_client_query(&client_query("example.com.", true), udp(), 100, 100_000);
        // the client query plus the root priming sub-query are live, and the
        // prime has an exchange pending towards a root hint
        assert_eq!(worker.active_queries(), 2);
        let outbound = worker.take_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].1.qinfo.qname, Name::root());
    }

    #[test]
    fn identical_subqueries_are_shared() {
        let mut worker = worker();
        worker.handle_client_query(&client_query("a.example.com.", true), udp(), 100, 100_000);
        worker.handle_client_query(&client_query("b.example.com.", true), udp(), 100, 100_000);
        // both clients need the root primed; only one prime sub-query runs
        assert_eq!(worker.active_queries(), 3);
        assert_eq!(worker.take_outbound().len(), 1);
    }

    #[test]
    fn jostle_displaces_old_queries_under_load() {
        let mut worker = worker();
        let mut config = Config::default();
        config.num_queries_per_thread = 2;
        let cfg = Arc::new(RuntimeConfig::from_config(config).unwrap());
        worker.env = Arc::new(ModuleEnv::new(cfg, Arc::new(TrustAnchorStore::empty())));

        worker.handle_client_query(&client_query("a.example.com.", true), udp(), 100, 1_000);
        // the second arrives long past the jostle timeout; with the table
        // full (client + prime sub), the old query is displaced
        worker.handle_client_query(&client_query("b.example.com.", true), udp(), 100, 10_000);
        let responses = worker.take_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message.response_code(), ResponseCode::ServFail);
        assert_eq!(responses[0].message.id(), 99);
    }
}
