//! Per-connection request broker.
//!
//! One broker actor task exclusively owns everything mutable about a
//! connection: the transaction id counter, the table of pending requests,
//! and the deadline index. All interaction goes through channels; replies
//! travel back through single-shot slots. Writes submitted to the same
//! broker are framed and transmitted in submission order; replies may
//! arrive out of order and are routed by transaction id.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::proto::{self, Message, Operation};
use crate::utils::ChunkDbError;

/// Deadline scan period.
const BROKER_TICK: Duration = Duration::from_millis(30);

/// Connect timeout for dialing a peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the submission channel; back-pressure suspends callers.
const SUBMIT_CHANNEL_CAPACITY: usize = 1024;

/// Distinguishes connections of the same peer across redials.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

/// Invoked exactly once when the broker shuts down, with the connection
/// id it was opened under.
pub type OnClose = Box<dyn FnOnce(u64) + Send>;

/// One request handed to the broker. A reply slot is present exactly when
/// the timeout is non-zero; zero-timeout submissions are fire-and-forget.
struct Submission {
    op: Operation,
    key: Bytes,
    value: Bytes,
    timeout: Duration,
    reply: Option<oneshot::Sender<Result<Bytes, ChunkDbError>>>,
}

/// Handle to one peer connection's broker. Cheap to clone; the broker
/// shuts down when every handle is dropped.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    tx_submit: mpsc::Sender<Submission>,
}

impl Connection {
    /// Dials the peer and spawns the broker, writer, and reader tasks.
    pub async fn open(
        addr: SocketAddr,
        on_close: Option<OnClose>,
    ) -> Result<Self, ChunkDbError> {
        let stream = match time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ChunkDbError::Transport(format!(
                    "dial {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(ChunkDbError::Transport(format!(
                    "dial {}: connect timeout",
                    addr
                )))
            }
        };
        stream.set_nodelay(true)?;

        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let (tx_frame, rx_frame) = proto::buffered(stream);
        let (tx_submit, rx_submit) = mpsc::channel(SUBMIT_CHANNEL_CAPACITY);

        let mut broker = BrokerTask {
            conn_id: id,
            peer: addr,
            rx_submit,
            tx_frame,
            rx_frame,
            next_tid: 0,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            on_close,
        };
        tokio::spawn(async move { broker.run().await });

        pf_debug!("connected to server '{}'", addr);
        Ok(Connection {
            id,
            peer: addr,
            tx_submit,
        })
    }

    /// Connection id, unique across redials of the same peer.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Peer address this connection is bound to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once the broker has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx_submit.is_closed()
    }

    /// Submits a request and waits for its outcome: the peer's reply, a
    /// deadline expiry, or connection shutdown, whichever happens first.
    /// The timeout must be non-zero.
    pub async fn request(
        &self,
        op: Operation,
        key: Bytes,
        value: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ChunkDbError> {
        if timeout.is_zero() {
            return logged_err!(
                "zero-timeout request for op {:?} on '{}'",
                op,
                self.peer
            );
        }

        let (tx_reply, rx_reply) = oneshot::channel();
        let sub = Submission {
            op,
            key,
            value,
            timeout,
            reply: Some(tx_reply),
        };
        self.tx_submit
            .send(sub)
            .await
            .map_err(|_| ChunkDbError::ConnectionClosed)?;
        rx_reply
            .await
            .unwrap_or(Err(ChunkDbError::ConnectionClosed))
    }

    /// Submits a fire-and-forget message: no reply slot is registered and
    /// no outcome is ever reported beyond the submission itself.
    pub async fn send_only(
        &self,
        op: Operation,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), ChunkDbError> {
        let sub = Submission {
            op,
            key,
            value,
            timeout: Duration::ZERO,
            reply: None,
        };
        self.tx_submit
            .send(sub)
            .await
            .map_err(|_| ChunkDbError::ConnectionClosed)
    }
}

/// The broker actor. Exactly one task owns these fields; there are no
/// locks anywhere on the request path.
struct BrokerTask {
    conn_id: u64,
    peer: SocketAddr,

    /// Inbound command channel of new submissions.
    rx_submit: mpsc::Receiver<Submission>,

    /// Outbound frames to the transport writer.
    tx_frame: mpsc::Sender<Message>,

    /// Inbound frames from the transport reader.
    rx_frame: mpsc::Receiver<Message>,

    /// Next transaction id; wraps freely (collisions with still-pending
    /// tids are prevented in practice by the 2^32-wide space and the
    /// bounded in-flight count).
    next_tid: u32,

    /// Reply slots of requests awaiting a reply, keyed by tid.
    pending: HashMap<u32, oneshot::Sender<Result<Bytes, ChunkDbError>>>,

    /// Earliest-deadline-first index over pending requests. Entries whose
    /// tid has already been resolved are skipped lazily during scans.
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,

    on_close: Option<OnClose>,
}

impl BrokerTask {
    async fn run(&mut self) {
        let mut scan_tick = time::interval(BROKER_TICK);
        scan_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                sub = self.rx_submit.recv() => match sub {
                    Some(sub) => {
                        if !self.handle_submission(sub).await {
                            break; // writer gone
                        }
                    },
                    None => break, // all handles dropped
                },

                frame = self.rx_frame.recv() => match frame {
                    Some(msg) => self.handle_reply(msg),
                    None => break, // socket EOF/error or malformed frame
                },

                _ = scan_tick.tick(), if !self.deadlines.is_empty() => {
                    self.scan_deadlines();
                },
            }
        }

        self.shutdown();
    }

    /// Assigns a tid, registers the reply slot when one is expected, and
    /// hands the frame to the writer. Returns false when the writer side
    /// is gone, which shuts the broker down.
    async fn handle_submission(&mut self, sub: Submission) -> bool {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);

        let Submission {
            op,
            key,
            value,
            timeout,
            reply,
        } = sub;

        if timeout.is_zero() {
            // fire-and-forget must not carry a reply slot
            if reply.is_some() {
                pf_error!(
                    "dropping reply slot of zero-timeout submission to '{}'",
                    self.peer
                );
            }
        } else {
            match reply {
                Some(slot) => {
                    self.pending.insert(tid, slot);
                    self.deadlines
                        .push(Reverse((Instant::now() + timeout, tid)));
                }
                None => pf_error!(
                    "timed submission to '{}' without a reply slot",
                    self.peer
                ),
            }
        }

        let msg = Message {
            op,
            id: tid,
            key,
            value,
        };
        self.tx_frame.send(msg).await.is_ok()
    }

    /// Routes an inbound frame to its reply slot. Frames whose tid is no
    /// longer pending were already timed out and are dropped.
    fn handle_reply(&mut self, msg: Message) {
        let Some(slot) = self.pending.remove(&msg.id) else {
            pf_trace!("dropping late reply tid {} from '{}'", msg.id, self.peer);
            return;
        };

        let outcome = match msg.op {
            Operation::GetResponse
            | Operation::GetConfResponse
            | Operation::GetChunkInfoResponse => Ok(msg.value),
            Operation::SetOk
            | Operation::DelOk
            | Operation::CasOk
            | Operation::ProtectOk
            | Operation::AddServerToGroupAck
            | Operation::TransferCompleted => Ok(Bytes::new()),
            Operation::Err => Err(ChunkDbError::Remote(
                String::from_utf8_lossy(&msg.value).into_owned(),
            )),
            other => Err(ChunkDbError::UnexpectedResponse(other as u8)),
        };

        // the slot is single-shot; a dropped receiver discards the reply
        let _ = slot.send(outcome);
    }

    /// Pops every expired entry off the deadline index and times out the
    /// ones still pending.
    fn scan_deadlines(&mut self) {
        let now = Instant::now();
        while let Some(&Reverse((deadline, tid))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(slot) = self.pending.remove(&tid) {
                pf_trace!("request tid {} to '{}' timed out", tid, self.peer);
                let _ = slot.send(Err(ChunkDbError::Timeout));
            }
        }
    }

    /// Fails every pending request, fires the close callback once, and
    /// stops the transport. New submissions fail synchronously once the
    /// submission channel is closed here.
    fn shutdown(&mut self) {
        self.rx_submit.close();
        for (_, slot) in self.pending.drain() {
            let _ = slot.send(Err(ChunkDbError::ConnectionClosed));
        }
        self.deadlines.clear();
        if let Some(cb) = self.on_close.take() {
            cb(self.conn_id);
        }
        pf_debug!("broker for '{}' shut down", self.peer);
        // dropping tx_frame stops the writer; dropping rx_frame lets the
        // reader observe a closed channel and release the socket
    }
}
