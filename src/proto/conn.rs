//! Buffered framed transport over one TCP connection.
//!
//! `buffered()` splits the socket and spawns a writer task and a reader
//! task, connected to the owner through bounded channels. The writer
//! accumulates outbound frames and flushes either when the buffer grows
//! past the size trigger or on a periodic time window, trading a bounded
//! per-message queuing delay for fewer, larger writes.

use bytes::{Buf, BytesMut};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::proto::{Message, BUFFER_SIZE, BUFFER_SIZE_TRIGGER, HEADER_SIZE};
use crate::utils::ChunkDbError;

/// Flush window for the outbound batcher.
const WINDOW_TIME_DURATION: Duration = Duration::from_micros(10);

/// Capacity of the channels between the owner and the two tasks.
pub(crate) const CHANNEL_CAPACITY: usize = 1024;

/// Wraps an established connection in a buffered framed transport.
/// Returns the sender of outbound messages and the receiver of inbound
/// messages. Closing the sender stops the writer (after a final flush);
/// the receiver's channel closes when the socket reports EOF, a socket
/// error, or a malformed inbound frame.
pub fn buffered(
    stream: TcpStream,
) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
    let (conn_read, conn_write) = stream.into_split();
    let (tx_out, rx_out) = mpsc::channel(CHANNEL_CAPACITY);
    let (tx_in, rx_in) = mpsc::channel(CHANNEL_CAPACITY);

    let mut writer = WriterTask {
        conn_write,
        rx_out,
        buffer: vec![0u8; BUFFER_SIZE],
        index: 0,
        dirty: false,
    };
    tokio::spawn(async move { writer.run().await });

    let mut reader = ReaderTask {
        conn_read,
        tx_in,
        read_buf: BytesMut::with_capacity(BUFFER_SIZE),
    };
    tokio::spawn(async move { reader.run().await });

    (tx_out, rx_in)
}

/// Outbound half: accumulates frames and writes them in batches.
struct WriterTask {
    conn_write: OwnedWriteHalf,
    rx_out: mpsc::Receiver<Message>,

    /// Accumulation buffer, `index` marking the first free byte.
    buffer: Vec<u8>,
    index: usize,

    /// Set when a frame lands in the buffer; the tick that observes it
    /// clears it instead of flushing, so a frame always gets one full
    /// window before the time-based flush.
    dirty: bool,
}

impl WriterTask {
    async fn run(&mut self) {
        let mut window = time::interval(WINDOW_TIME_DURATION);
        window.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = window.tick() => {
                    if self.index > 0 && !self.dirty {
                        if self.flush().await.is_err() {
                            break;
                        }
                    } else {
                        self.dirty = false;
                    }
                },

                msg = self.rx_out.recv() => match msg {
                    Some(msg) => {
                        if self.append(msg).await.is_err() {
                            break;
                        }
                    },
                    None => {
                        // channel closed; ship any residue and stop
                        if self.index > 0 {
                            let _ = self.flush().await;
                        }
                        break;
                    }
                },
            }
        }

        pf_debug!("transport writer task exited");
    }

    /// Appends a frame to the buffer, flushing by the size trigger or
    /// writing oversize frames standalone.
    async fn append(&mut self, msg: Message) -> Result<(), ChunkDbError> {
        let (msg_size, too_long) =
            msg.encode_into(&mut self.buffer[self.index..]);
        if too_long {
            // ship the accumulated buffer first, then this frame in a
            // single standalone write
            if self.index > 0 {
                self.flush().await?;
            }
            let mut big_msg = vec![0u8; msg_size];
            msg.encode_into(&mut big_msg);
            self.conn_write.write_all(&big_msg).await?;
            return Ok(());
        }

        self.index += msg_size;
        if self.index > BUFFER_SIZE_TRIGGER {
            self.flush().await?;
        } else {
            self.dirty = true;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ChunkDbError> {
        self.conn_write.write_all(&self.buffer[..self.index]).await?;
        self.index = 0;
        Ok(())
    }
}

/// Inbound half: reassembles frames from the byte stream and emits them.
struct ReaderTask {
    conn_read: OwnedReadHalf,
    tx_in: mpsc::Sender<Message>,

    /// Partial-frame storage; decoded frames are advanced past so
    /// residual bytes stay available for the next frame.
    read_buf: BytesMut,
}

impl ReaderTask {
    async fn run(&mut self) {
        loop {
            // a full header tells us the frame size
            while self.read_buf.len() < HEADER_SIZE {
                if !self.fill().await {
                    return;
                }
            }
            let msg_size = u32::from_le_bytes(
                self.read_buf[0..4].try_into().unwrap(),
            ) as usize;
            if msg_size < HEADER_SIZE {
                pf_error!("malformed inbound frame: size field {}", msg_size);
                return;
            }

            // frames larger than the steady buffer get a one-shot
            // reservation sized for the whole frame
            if self.read_buf.capacity() < msg_size {
                self.read_buf.reserve(msg_size - self.read_buf.capacity());
            }
            while self.read_buf.len() < msg_size {
                if !self.fill().await {
                    return;
                }
            }

            match Message::decode(&self.read_buf[..msg_size]) {
                Ok(msg) => {
                    if self.tx_in.send(msg).await.is_err() {
                        return; // owner gone
                    }
                }
                Err(e) => {
                    pf_error!("malformed inbound frame: {}", e);
                    return;
                }
            }
            self.read_buf.advance(msg_size);
        }
    }

    /// Reads more bytes into the buffer. Returns false on EOF, socket
    /// error, or owner disappearance, all of which stop the task (and
    /// thereby close the inbound channel to signal downstream).
    async fn fill(&mut self) -> bool {
        if self.read_buf.capacity() == self.read_buf.len() {
            self.read_buf.reserve(BUFFER_SIZE);
        }
        tokio::select! {
            n = self.conn_read.read_buf(&mut self.read_buf) => match n {
                Ok(0) => {
                    pf_debug!("transport reader hit EOF");
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    pf_debug!("transport reader error: {}", e);
                    false
                }
            },
            () = self.tx_in.closed() => false,
        }
    }
}
