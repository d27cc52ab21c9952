//! The module pipeline contract.
//!
//! A query is processed by a fixed, ordered list of modules (iterator, then
//! validator). Each module keeps a per-query state object and advances it
//! in response to events delivered by the worker. A module returns one of
//! the [`ModuleState`] values; `Finished` passes control to the next module
//! and, at the end of the list, back to the worker for response emission.
//!
//! Everything a module needs from the outside world travels in the
//! [`ModuleEnv`]: configuration and the shared caches. There is no ambient
//! global state.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::Name;

use crate::cache::{MessageCache, RrsetCache};
use crate::config::RuntimeConfig;
use crate::delegation::DelegationPoint;
use crate::infra::InfraCache;
use crate::iterator::{IterModule, IterQState};
use crate::reply::{QueryInfo, Reply};
use crate::validator::{neg::NegCache, KeyCache, TrustAnchorStore, ValModule, ValQState};

/// What a module is waiting for after handling an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    /// An outbound query to an authoritative server is pending
    WaitReply,
    /// One or more dependent resolver tasks are pending
    WaitSubquery,
    /// Waiting for another module in the stack
    WaitModule,
    /// The query failed; the worker converts this to an RCODE
    Error,
    /// This module is done with the query
    Finished,
}

/// Events delivered to a module by the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleEvent {
    /// A new query enters the module
    NewQuery,
    /// The preceding module finished and handed the query over
    Pass,
    /// The outbound reply arrived; it is in `QueryState::response`
    Reply,
    /// The outbound query timed out
    Timeout,
    /// A sub-query completed; its results were merged by `inform_super`
    SubqueryDone,
    /// The query failed elsewhere in the stack
    Error,
}

/// Client-visible query flags carried through resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryFlags {
    pub recursion_desired: bool,
    /// Checking disabled: skip validation and say so
    pub checking_disabled: bool,
    /// The client asked for DNSSEC records (DO bit)
    pub dnssec_ok: bool,
}

/// What kind of sub-query a module is asking for.
#[derive(Clone, Debug)]
pub enum SubKind {
    /// An ordinary recursive resolution through the full pipeline
    Normal,
    /// A priming query: resolve against a fixed delegation point and feed
    /// the result into the caches
    Prime(DelegationPoint),
}

/// A sub-query requested by a module.
#[derive(Clone, Debug)]
pub struct SubRequest {
    pub qinfo: QueryInfo,
    pub kind: SubKind,
    /// Index of the module that asked; its `inform_super` runs on completion
    pub initiator: usize,
    /// Do not consult the message cache (used for prefetch refreshes)
    pub bypass_cache: bool,
}

/// An outbound exchange requested by the iterator.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub qinfo: QueryInfo,
    pub target: SocketAddr,
    /// Zone the target serves, for infrastructure accounting
    pub zone: Name,
    /// Ask for DNSSEC records (DO bit) upstream
    pub dnssec: bool,
    /// Set the RD flag; only done towards forwarders
    pub recursion_desired: bool,
    /// Timeout for this attempt, milliseconds
    pub timeout_ms: u32,
}

/// Per-module, per-query state storage.
#[derive(Debug, Default)]
pub enum ModuleQState {
    #[default]
    Empty,
    Iter(Box<IterQState>),
    Val(Box<ValQState>),
}

/// The per-query state threaded through the module stack.
#[derive(Debug)]
pub struct QueryState {
    pub id: u64,
    pub qinfo: QueryInfo,
    pub flags: QueryFlags,
    /// Dependency depth: zero for client queries, parent + 1 for sub-queries
    pub depth: usize,
    /// Wall-clock seconds, refreshed by the worker before each dispatch
    pub now: u64,
    /// Inbound wire reply for a `Reply` event
    pub response: Option<Message>,
    /// The reply being built; set by the iterator, validated in place
    pub return_msg: Option<Reply>,
    pub return_rcode: ResponseCode,
    /// Index of the module currently operating on the query
    pub curmod: usize,
    /// Last state returned by each module
    pub ext_state: Vec<ModuleState>,
    pub minfo: Vec<ModuleQState>,
    /// Skip the message cache in INIT (prefetch refresh queries)
    pub bypass_cache: bool,
    /// Mailbox: outbound exchange to start when `WaitReply` is returned
    pub outbound: Option<OutboundRequest>,
    /// Mailbox: sub-queries to spawn when `WaitSubquery` is returned
    pub subs: Vec<SubRequest>,
    /// Mailbox: query-infos worth refreshing in the background
    pub prefetch: Vec<QueryInfo>,
}

impl QueryState {
    pub fn new(id: u64, qinfo: QueryInfo, flags: QueryFlags, modules: usize, now: u64) -> Self {
        Self {
            id,
            qinfo,
            flags,
            depth: 0,
            now,
            response: None,
            return_msg: None,
            return_rcode: ResponseCode::NoError,
            curmod: 0,
            ext_state: vec![ModuleState::Finished; modules],
            minfo: (0..modules).map(|_| ModuleQState::Empty).collect(),
            bypass_cache: false,
            outbound: None,
            subs: Vec::new(),
            prefetch: Vec::new(),
        }
    }

    /// Request a sub-query from the module at `initiator`.
    pub fn attach_sub(&mut self, qinfo: QueryInfo, kind: SubKind, initiator: usize) {
        self.subs.push(SubRequest {
            qinfo,
            kind,
            initiator,
            bypass_cache: false,
        });
    }
}

/// The environment handed to every module entry point.
pub struct ModuleEnv {
    pub cfg: Arc<RuntimeConfig>,
    pub msg_cache: Arc<MessageCache>,
    pub rrset_cache: Arc<RrsetCache>,
    pub infra: Arc<InfraCache>,
    pub key_cache: Arc<KeyCache>,
    pub neg_cache: Arc<NegCache>,
    pub anchors: Arc<TrustAnchorStore>,
    /// Replies that failed to match an outstanding exchange
    pub unwanted_replies: AtomicU64,
}

impl ModuleEnv {
    pub fn new(cfg: Arc<RuntimeConfig>, anchors: Arc<TrustAnchorStore>) -> Self {
        let c = &cfg.cfg;
        Self {
            msg_cache: Arc::new(MessageCache::new(c.msg_cache_slabs, c.msg_cache_size)),
            rrset_cache: Arc::new(RrsetCache::new(c.rrset_cache_slabs, c.rrset_cache_size)),
            infra: Arc::new(InfraCache::new(
                c.infra_cache_slabs,
                c.infra_cache_numhosts,
                c.host_ttl,
            )),
            key_cache: Arc::new(KeyCache::new(c.key_cache_slabs, c.key_cache_size)),
            neg_cache: Arc::new(NegCache::new(c.neg_cache_size)),
            anchors,
            unwanted_replies: AtomicU64::new(0),
            cfg,
        }
    }

    /// Flush the shared caches, the countermeasure against cache poisoning.
    pub fn flush_caches(&self) {
        self.msg_cache.clear();
        self.rrset_cache.clear();
        self.key_cache.clear();
    }
}

/// A module of the pipeline. The set is closed: the pipeline is a fixed
/// ordered list of these variants.
pub enum Module {
    Iterator(IterModule),
    Validator(ValModule),
}

impl Module {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Iterator(_) => "iterator",
            Self::Validator(_) => "validator",
        }
    }

    pub fn operate(
        &self,
        qstate: &mut QueryState,
        event: ModuleEvent,
        env: &ModuleEnv,
    ) -> ModuleState {
        match self {
            Self::Iterator(m) => m.operate(qstate, event, env),
            Self::Validator(m) => m.operate(qstate, event, env),
        }
    }

    /// Deliver a finished sub-query's results to one of its parents.
    pub fn inform_super(&self, sub: &mut QueryState, superq: &mut QueryState, env: &ModuleEnv) {
        match self {
            Self::Iterator(m) => m.inform_super(sub, superq, env),
            Self::Validator(m) => m.inform_super(sub, superq, env),
        }
    }

    /// Drop per-query state held by this module.
    pub fn clear(&self, qstate: &mut QueryState) {
        let index = match self {
            Self::Iterator(_) => 0,
            Self::Validator(_) => 1,
        };
        if let Some(slot) = qstate.minfo.get_mut(index) {
            *slot = ModuleQState::Empty;
        }
    }

    /// Memory held for a query by this module, for debug accounting.
    pub fn get_mem(&self, qstate: &QueryState) -> usize {
        match self {
            Self::Iterator(_) => qstate
                .minfo
                .first()
                .map(|s| std::mem::size_of_val(s))
                .unwrap_or(0),
            Self::Validator(_) => qstate
                .minfo
                .get(1)
                .map(|s| std::mem::size_of_val(s))
                .unwrap_or(0),
        }
    }
}

/// The fixed module list queries travel through.
pub struct Pipeline {
    pub modules: Vec<Module>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            modules: vec![
                Module::Iterator(IterModule),
                Module::Validator(ValModule),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
