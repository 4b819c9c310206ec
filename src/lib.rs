//! Public interface to the ChunkDB client core library: the request
//! broker and multi-replica access layer of a distributed, replicated,
//! chunk-sharded key-value store.
//!
//! Keys are routed to chunks by FNV-1a; each chunk's current holders
//! come from the membership view; operations fan out to the holders over
//! multiplexed, deadline-bounded TCP connections and reconcile under
//! last-write-wins.

#[macro_use]
mod utils;

pub mod proto;

mod client;
mod cluster;

pub use client::{ClientConfig, Connection, DbClient, OnClose, ServerEntry};
pub use cluster::{ClusterDescriptor, ClusterView, ServerDescriptor};
pub use utils::{chunk_of, fnv1a_64, ChunkDbError};
