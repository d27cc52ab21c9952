//! Shared cache layers: the sharded slab store and the typed RRset and
//! message caches built on top of it.

pub mod message;
pub mod rrset;
pub mod slab;

pub use message::{CachedReply, MessageCache, MessageEntry, RrsetRef};
pub use rrset::RrsetCache;
pub use slab::{MemSize, SlabCache};
