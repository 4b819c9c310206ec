//! In-process test server speaking the ChunkDB wire protocol over real
//! TCP sockets, with an in-memory map carrying the LWW/CAS semantics of
//! the storage collaborator. Stands in for a cluster server in the
//! end-to-end scenarios.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use chunkdb::proto::{Message, Operation, HEADER_SIZE};
use chunkdb::{chunk_of, fnv1a_64, ClusterDescriptor, ServerDescriptor};

/// Store shared between server instances to simulate completed chunk
/// migration. Values are stored timestamp-prefixed, as on the wire.
pub type SharedStore = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

/// Default refusal limit on inbound frames.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

pub struct TestServer {
    addr: SocketAddr,
    store: SharedStore,
    responsive: Arc<AtomicBool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

struct ServerCtx {
    addr: SocketAddr,
    num_chunks: u32,
    max_frame: usize,
    store: SharedStore,
    responsive: Arc<AtomicBool>,
}

impl TestServer {
    pub async fn spawn(num_chunks: u32) -> TestServer {
        Self::spawn_with(
            num_chunks,
            Arc::new(Mutex::new(HashMap::new())),
            DEFAULT_MAX_FRAME,
        )
        .await
    }

    pub async fn spawn_with(
        num_chunks: u32,
        store: SharedStore,
        max_frame: usize,
    ) -> TestServer {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responsive = Arc::new(AtomicBool::new(true));
        let handles = Arc::new(Mutex::new(Vec::new()));

        let ctx = Arc::new(ServerCtx {
            addr,
            num_chunks,
            max_frame,
            store: store.clone(),
            responsive: responsive.clone(),
        });
        let conn_handles = handles.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let ctx = ctx.clone();
                let handle =
                    tokio::spawn(async move { serve_conn(stream, ctx).await });
                conn_handles.lock().unwrap().push(handle);
            }
        });
        handles.lock().unwrap().push(acceptor);

        TestServer {
            addr,
            store,
            responsive,
            handles,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// When false, inbound requests are read and swallowed without reply.
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Aborts the acceptor and every connection task, closing all
    /// sockets.
    pub fn kill(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve_conn(mut stream: TcpStream, ctx: Arc<ServerCtx>) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let size =
            u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        if size < HEADER_SIZE {
            return;
        }
        let id = u32::from_le_bytes(header[4..8].try_into().unwrap());

        if size > ctx.max_frame {
            // refuse without materializing the frame: drain the body,
            // then answer with a size error
            let mut remaining = size - HEADER_SIZE;
            let mut sink = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let n = sink.len().min(remaining);
                if stream.read_exact(&mut sink[..n]).await.is_err() {
                    return;
                }
                remaining -= n;
            }
            if ctx.responsive.load(Ordering::SeqCst) {
                let refusal =
                    err_msg(id, b"message size limit exceeded");
                if write_msg(&mut stream, &refusal).await.is_err() {
                    return;
                }
            }
            continue;
        }

        let mut frame = vec![0u8; size];
        frame[..HEADER_SIZE].copy_from_slice(&header);
        if stream.read_exact(&mut frame[HEADER_SIZE..]).await.is_err() {
            return;
        }
        let Ok(msg) = Message::decode(&frame) else {
            return;
        };

        if !ctx.responsive.load(Ordering::SeqCst) {
            continue;
        }
        let reply = handle_request(&ctx, msg);
        if write_msg(&mut stream, &reply).await.is_err() {
            return;
        }
    }
}

fn handle_request(ctx: &ServerCtx, msg: Message) -> Message {
    match msg.op {
        Operation::Get => {
            let value = ctx
                .store
                .lock()
                .unwrap()
                .get(msg.key.as_ref())
                .cloned()
                .unwrap_or_default();
            reply(Operation::GetResponse, msg.id, value.into())
        }

        Operation::Set => {
            let mut store = ctx.store.lock().unwrap();
            let newer = match store.get(msg.key.as_ref()) {
                Some(stored) => record_ts(&msg.value) >= record_ts(stored),
                None => true,
            };
            if newer {
                store.insert(msg.key.to_vec(), msg.value.to_vec());
            }
            reply(Operation::SetOk, msg.id, Bytes::new())
        }

        Operation::Del => {
            ctx.store.lock().unwrap().remove(msg.key.as_ref());
            reply(Operation::DelOk, msg.id, Bytes::new())
        }

        Operation::Cas => {
            if msg.value.len() < 24 {
                return err_msg(msg.id, b"malformed cas request");
            }
            let expected_ts =
                u64::from_le_bytes(msg.value[0..8].try_into().unwrap());
            let expected_hash =
                u64::from_le_bytes(msg.value[8..16].try_into().unwrap());

            let mut store = ctx.store.lock().unwrap();
            let (current_ts, current_hash) =
                match store.get(msg.key.as_ref()) {
                    Some(stored) if stored.len() >= 8 => {
                        (record_ts(stored), fnv1a_64(&stored[8..]))
                    }
                    _ => (0, fnv1a_64(b"")),
                };
            if current_ts == expected_ts && current_hash == expected_hash {
                store.insert(msg.key.to_vec(), msg.value[16..].to_vec());
                reply(Operation::CasOk, msg.id, Bytes::new())
            } else {
                err_msg(msg.id, b"cas conflict")
            }
        }

        Operation::GetConf => {
            let desc = ClusterDescriptor {
                num_chunks: ctx.num_chunks,
                servers: vec![ServerDescriptor {
                    addr: ctx.addr,
                    chunks: (0..ctx.num_chunks).collect(),
                }],
            };
            reply(
                Operation::GetConfResponse,
                msg.id,
                desc.encode().unwrap().into(),
            )
        }

        Operation::GetChunkInfo => {
            let Some(chunk_bytes) = msg.key.get(0..4) else {
                return err_msg(msg.id, b"malformed chunk id");
            };
            let chunk = u32::from_le_bytes(chunk_bytes.try_into().unwrap());
            let total: u64 = ctx
                .store
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| chunk_of(key, ctx.num_chunks) == chunk)
                .map(|(_, value)| value.len() as u64)
                .sum();
            reply(
                Operation::GetChunkInfoResponse,
                msg.id,
                Bytes::copy_from_slice(&total.to_le_bytes()),
            )
        }

        Operation::AddServerToGroup => {
            reply(Operation::AddServerToGroupAck, msg.id, Bytes::new())
        }
        Operation::Transfer => {
            reply(Operation::TransferCompleted, msg.id, Bytes::new())
        }
        Operation::Protect => reply(Operation::ProtectOk, msg.id, Bytes::new()),

        _ => err_msg(msg.id, b"unexpected operation"),
    }
}

fn record_ts(stored: &[u8]) -> u64 {
    stored
        .get(0..8)
        .map(|ts| u64::from_le_bytes(ts.try_into().unwrap()))
        .unwrap_or(0)
}

fn reply(op: Operation, id: u32, value: Bytes) -> Message {
    Message {
        op,
        id,
        key: Bytes::new(),
        value,
    }
}

fn err_msg(id: u32, diagnostic: &'static [u8]) -> Message {
    reply(Operation::Err, id, Bytes::from_static(diagnostic))
}

async fn write_msg(
    stream: &mut TcpStream,
    msg: &Message,
) -> std::io::Result<()> {
    let mut frame = vec![0u8; msg.wire_size()];
    msg.encode_into(&mut frame);
    stream.write_all(&frame).await
}

/// Builds a timestamp-prefixed record the way the dispatcher frames Sets
/// (for preloading stores directly in tests).
pub fn record(ts: u64, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(8 + payload.len());
    framed.extend_from_slice(&ts.to_le_bytes());
    framed.extend_from_slice(payload);
    framed
}
