//! Cluster membership view and the bootstrap access-info descriptor.
//!
//! The view maps each chunk to its ordered list of holders. It is
//! populated once from the `GetConf` descriptor at bootstrap and from
//! then on maintained by the heartbeat collaborator through the writer
//! API; the dispatcher only ever takes per-call read snapshots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tokio::sync::RwLock;

use crate::client::ServerEntry;
use crate::utils::ChunkDbError;

/// One server's slice of the cluster descriptor.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Server address.
    pub addr: SocketAddr,

    /// Chunks this server currently holds.
    pub chunks: Vec<u32>,
}

/// Serialized cluster access info, as carried in a `GetConfResponse`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    /// Number of chunks the keyspace is split into; fixed at cluster
    /// creation.
    pub num_chunks: u32,

    /// Known servers and their held chunks, in holder order.
    pub servers: Vec<ServerDescriptor>,
}

impl ClusterDescriptor {
    /// Decodes a descriptor from a `GetConfResponse` value.
    pub fn decode(raw: &[u8]) -> Result<Self, ChunkDbError> {
        Ok(rmp_serde::from_slice(raw)?)
    }

    /// Encodes the descriptor for a `GetConfResponse` value.
    pub fn encode(&self) -> Result<Vec<u8>, ChunkDbError> {
        Ok(rmp_serde::to_vec(self)?)
    }
}

/// Current membership view: chunk -> ordered holders. Shared-read by
/// dispatcher calls; written only by the heartbeat collaborator (and by
/// bootstrap).
pub struct ClusterView {
    /// Number of chunks; never changes after creation.
    num_chunks: u32,

    /// Ordered holder list per chunk, indexed by chunk id.
    chunk_holders: RwLock<Vec<Vec<Arc<ServerEntry>>>>,

    /// All known servers by address.
    servers: RwLock<HashMap<SocketAddr, Arc<ServerEntry>>>,
}

impl ClusterView {
    /// Creates an empty view over `num_chunks` chunks.
    pub fn new(num_chunks: u32) -> Result<Self, ChunkDbError> {
        if num_chunks == 0 {
            return Err(ChunkDbError::Config(
                "cluster with zero chunks".into(),
            ));
        }
        Ok(ClusterView {
            num_chunks,
            chunk_holders: RwLock::new(vec![
                Vec::new();
                num_chunks as usize
            ]),
            servers: RwLock::new(HashMap::new()),
        })
    }

    /// Builds a view from a bootstrap descriptor.
    pub async fn from_descriptor(
        desc: &ClusterDescriptor,
    ) -> Result<Self, ChunkDbError> {
        let view = Self::new(desc.num_chunks)?;
        for server in &desc.servers {
            let entry = view.add_server(server.addr).await;
            let mut holders = view.chunk_holders.write().await;
            for &chunk in &server.chunks {
                if chunk >= desc.num_chunks {
                    return Err(ChunkDbError::Config(format!(
                        "descriptor holds chunk {} outside 0..{}",
                        chunk, desc.num_chunks
                    )));
                }
                holders[chunk as usize].push(entry.clone());
            }
        }
        Ok(view)
    }

    /// Number of chunks the keyspace is split into.
    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    /// Snapshot of the current ordered holder list of a chunk.
    pub async fn holders_of(&self, chunk: u32) -> Vec<Arc<ServerEntry>> {
        let holders = self.chunk_holders.read().await;
        holders
            .get(chunk as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Looks up a known server by address.
    pub async fn server(
        &self,
        addr: SocketAddr,
    ) -> Option<Arc<ServerEntry>> {
        self.servers.read().await.get(&addr).cloned()
    }

    /// Registers a server (idempotent) and returns its entry.
    pub async fn add_server(&self, addr: SocketAddr) -> Arc<ServerEntry> {
        let mut servers = self.servers.write().await;
        servers
            .entry(addr)
            .or_insert_with(|| ServerEntry::new(addr))
            .clone()
    }

    /// Replaces the ordered holder list of a chunk. Unknown addresses are
    /// registered on the fly (heartbeat collaborator API).
    pub async fn set_holders(
        &self,
        chunk: u32,
        addrs: &[SocketAddr],
    ) -> Result<(), ChunkDbError> {
        if chunk >= self.num_chunks {
            return Err(ChunkDbError::Config(format!(
                "chunk {} outside 0..{}",
                chunk, self.num_chunks
            )));
        }
        let mut entries = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            entries.push(self.add_server(addr).await);
        }
        self.chunk_holders.write().await[chunk as usize] = entries;
        Ok(())
    }

    /// Updates a server's liveness flag (heartbeat collaborator API).
    pub async fn set_alive(&self, addr: SocketAddr, alive: bool) {
        if let Some(entry) = self.server(addr).await {
            entry.set_alive(alive);
        }
    }

    /// Forgets a server and removes it from every holder list
    /// (heartbeat collaborator API).
    pub async fn remove_server(&self, addr: SocketAddr) {
        let removed = self.servers.write().await.remove(&addr);
        if removed.is_some() {
            let mut holders = self.chunk_holders.write().await;
            for list in holders.iter_mut() {
                list.retain(|entry| entry.addr() != addr);
            }
        }
    }

    /// Drops every established connection; the next operation on any
    /// entry redials.
    pub async fn disconnect_all(&self) {
        for entry in self.servers.read().await.values() {
            entry.disconnect();
        }
    }
}
