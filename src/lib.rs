//! A recursive, caching DNS resolver with DNSSEC validation.
//!
//! Queries travel a fixed module pipeline: the iterator walks the
//! delegation tree from the root hints (or a forwarder) to an answer, and
//! the validator checks that answer against the configured trust anchors.
//! Both feed and consume shared, sharded caches of messages, RRsets, keys
//! and per-server infrastructure state. Each worker thread drives its own
//! queries on its own event loop; only the caches are shared.

#![warn(
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::unimplemented,
    rust_2018_idioms
)]
#![allow(clippy::single_component_path_imports)]

pub mod cache;
pub mod config;
pub mod delegation;
pub mod error;
pub mod infra;
pub mod iterator;
pub mod module;
pub mod outbound;
pub mod reply;
pub mod server;
pub mod validator;
pub mod worker;

pub use config::{Config, RuntimeConfig};
pub use error::{Error, ErrorKind, Result};
pub use module::{ModuleEnv, Pipeline};
pub use reply::{PackedRrset, QueryInfo, Reply, TrustLevel};
pub use server::ServerWorker;
pub use validator::TrustAnchorStore;
pub use worker::Worker;
