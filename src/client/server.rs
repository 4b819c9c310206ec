//! Replica-set client: one peer server exposed through typed operations,
//! with a lazily (re-)established connection broker underneath.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use bytes::Bytes;

use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::client::broker::{Connection, OnClose};
use crate::proto::Operation;
use crate::utils::ChunkDbError;

/// Fixed deadline for control-plane operations.
const CONTROL_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// One server of the cluster as seen by the client. The entry owns its
/// broker; a peer with no broker (never used, or its connection died)
/// dials lazily on next use.
pub struct ServerEntry {
    /// Peer address.
    addr: SocketAddr,

    /// Liveness as reported by the heartbeat collaborator. Calls
    /// targeting a dead entry are skipped by the dispatcher.
    alive: AtomicBool,

    /// Current connection handle, if any. Kept in a sync mutex so the
    /// broker's close callback can clear it without an executor context;
    /// never held across an await.
    conn: StdMutex<Option<Connection>>,

    /// Serializes dialing so concurrent first users share one connection.
    dial_lock: Mutex<()>,

    /// Back-reference handed to the close callback.
    weak_self: Weak<ServerEntry>,
}

impl ServerEntry {
    /// Creates an entry for a peer; no connection is attempted yet.
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new_cyclic(|weak| ServerEntry {
            addr,
            alive: AtomicBool::new(true),
            conn: StdMutex::new(None),
            dial_lock: Mutex::new(()),
            weak_self: weak.clone(),
        })
    }

    /// Peer address of this entry.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current liveness flag.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Updates the liveness flag (heartbeat collaborator API).
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Drops the current connection, if any; the next operation redials.
    pub fn disconnect(&self) {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Returns the live connection or dials a new one. Dial failure
    /// surfaces as `Unreachable`.
    async fn connection(&self) -> Result<Connection, ChunkDbError> {
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }

        let _dialing = self.dial_lock.lock().await;
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }

        let weak = self.weak_self.clone();
        let on_close: OnClose = Box::new(move |conn_id| {
            if let Some(entry) = weak.upgrade() {
                entry.forget_connection(conn_id);
            }
        });
        let conn = match Connection::open(self.addr, Some(on_close)).await {
            Ok(conn) => conn,
            Err(e) => {
                pf_warn!("dial to holder '{}' failed: {}", self.addr, e);
                return Err(ChunkDbError::Unreachable);
            }
        };

        *self.conn.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(conn.clone());
        Ok(conn)
    }

    fn current_connection(&self) -> Option<Connection> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Clears the slot when the broker it belongs to shuts down; a newer
    /// connection under the same entry is left alone.
    fn forget_connection(&self, conn_id: u64) {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|conn| conn.id() == conn_id) {
            *slot = None;
        }
    }

    /// Fetches the stored value of a key (timestamp prefix included).
    pub async fn get(
        &self,
        key: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ChunkDbError> {
        let conn = self.connection().await?;
        conn.request(Operation::Get, key, Bytes::new(), timeout).await
    }

    /// Stores a timestamped value under a key. A zero timeout submits
    /// fire-and-forget.
    pub async fn set(
        &self,
        key: Bytes,
        value: Bytes,
        timeout: Duration,
    ) -> Result<(), ChunkDbError> {
        let conn = self.connection().await?;
        if timeout.is_zero() {
            conn.send_only(Operation::Set, key, value).await
        } else {
            conn.request(Operation::Set, key, value, timeout)
                .await
                .map(|_| ())
        }
    }

    /// Deletes a key. The request carries no value.
    pub async fn del(
        &self,
        key: Bytes,
        timeout: Duration,
    ) -> Result<(), ChunkDbError> {
        let conn = self.connection().await?;
        conn.request(Operation::Del, key, Bytes::new(), timeout)
            .await
            .map(|_| ())
    }

    /// Submits a compare-and-swap request; `value` carries the encoded
    /// comparison and replacement (see the dispatcher).
    pub async fn cas(
        &self,
        key: Bytes,
        value: Bytes,
        timeout: Duration,
    ) -> Result<(), ChunkDbError> {
        let conn = self.connection().await?;
        conn.request(Operation::Cas, key, value, timeout)
            .await
            .map(|_| ())
    }

    /// Requests the serialized cluster descriptor from this server.
    pub async fn get_conf(&self) -> Result<Bytes, ChunkDbError> {
        let conn = self.connection().await?;
        conn.request(
            Operation::GetConf,
            Bytes::new(),
            Bytes::new(),
            CONTROL_OP_TIMEOUT,
        )
        .await
    }

    /// Asks this server to admit `addr` into the server group
    /// (control-plane collaborator operation).
    pub async fn add_server_to_group(
        &self,
        addr: SocketAddr,
    ) -> Result<(), ChunkDbError> {
        let conn = self.connection().await?;
        conn.request(
            Operation::AddServerToGroup,
            Bytes::from(addr.to_string().into_bytes()),
            Bytes::new(),
            CONTROL_OP_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Fetches the stored size of a chunk on this server.
    pub async fn get_chunk_info(
        &self,
        chunk: u32,
    ) -> Result<u64, ChunkDbError> {
        let conn = self.connection().await?;
        let value = conn
            .request(
                Operation::GetChunkInfo,
                Bytes::copy_from_slice(&chunk.to_le_bytes()),
                Bytes::new(),
                CONTROL_OP_TIMEOUT,
            )
            .await?;
        let size = value.get(..8).ok_or_else(|| {
            ChunkDbError::Internal(format!(
                "short chunk info response: {} bytes",
                value.len()
            ))
        })?;
        Ok(u64::from_le_bytes(size.try_into().unwrap()))
    }

    /// Asks this server to transfer a chunk to the given destination
    /// (rebalancing collaborator operation).
    pub async fn transfer(
        &self,
        dest: SocketAddr,
        chunk: u32,
    ) -> Result<(), ChunkDbError> {
        let conn = self.connection().await?;
        conn.request(
            Operation::Transfer,
            Bytes::copy_from_slice(&chunk.to_le_bytes()),
            Bytes::from(dest.to_string().into_bytes()),
            CONTROL_OP_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Asks this server to protect a chunk against deletion during
    /// rebalance (collaborator operation).
    pub async fn protect(&self, chunk: u32) -> Result<(), ChunkDbError> {
        let conn = self.connection().await?;
        conn.request(
            Operation::Protect,
            Bytes::copy_from_slice(&chunk.to_le_bytes()),
            Bytes::new(),
            CONTROL_OP_TIMEOUT,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::proto::{self, Message};
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio::time;

    /// Accept loop serving Get/Set over a store shared across redials.
    async fn spawn_kv_peer(
        close_after: Option<usize>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store: Arc<StdMutex<HashMap<Bytes, Bytes>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let store = store.clone();
                tokio::spawn(async move {
                    let (tx, mut rx) = proto::buffered(stream);
                    let mut served = 0usize;
                    while let Some(msg) = rx.recv().await {
                        let reply = match msg.op {
                            Operation::Get => Message {
                                op: Operation::GetResponse,
                                id: msg.id,
                                key: Bytes::new(),
                                value: store
                                    .lock()
                                    .unwrap()
                                    .get(&msg.key)
                                    .cloned()
                                    .unwrap_or_default(),
                            },
                            Operation::Set => {
                                store
                                    .lock()
                                    .unwrap()
                                    .insert(msg.key, msg.value);
                                Message {
                                    op: Operation::SetOk,
                                    id: msg.id,
                                    key: Bytes::new(),
                                    value: Bytes::new(),
                                }
                            }
                            _ => Message {
                                op: Operation::Err,
                                id: msg.id,
                                key: Bytes::new(),
                                value: Bytes::from_static(b"unsupported"),
                            },
                        };
                        if tx.send(reply).await.is_err() {
                            break;
                        }
                        served += 1;
                        if close_after.is_some_and(|n| served >= n) {
                            break; // drop the connection mid-session
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lazy_dial_and_roundtrip() {
        let addr = spawn_kv_peer(None).await;
        let entry = ServerEntry::new(addr);
        assert!(entry.current_connection().is_none());

        let timeout = Duration::from_millis(500);
        entry
            .set(
                Bytes::from_static(b"hola"),
                Bytes::from_static(b"mundo"),
                timeout,
            )
            .await
            .unwrap();
        assert!(entry.current_connection().is_some());

        let value = entry
            .get(Bytes::from_static(b"hola"), timeout)
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"mundo"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn redial_after_peer_close() {
        let addr = spawn_kv_peer(Some(1)).await;
        let entry = ServerEntry::new(addr);
        let timeout = Duration::from_millis(500);

        entry
            .set(
                Bytes::from_static(b"hola"),
                Bytes::from_static(b"mundo"),
                timeout,
            )
            .await
            .unwrap();

        // the peer drops the connection after one reply; the close
        // callback clears the slot and the next call dials afresh
        time::sleep(Duration::from_millis(100)).await;
        assert!(entry.current_connection().is_none());

        let value = entry
            .get(Bytes::from_static(b"hola"), timeout)
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"mundo"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_peer_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let entry = ServerEntry::new(addr);
        let result = entry
            .get(Bytes::from_static(b"hola"), Duration::from_millis(500))
            .await;
        assert_eq!(result, Err(ChunkDbError::Unreachable));
    }

    #[test]
    fn liveness_flag() {
        let entry = ServerEntry::new("127.0.0.1:9999".parse().unwrap());
        assert!(entry.is_alive());
        entry.set_alive(false);
        assert!(!entry.is_alive());
    }
}
