//! Wire protocol: message framing codec and the buffered TCP transport.
//!
//! ## Frame format
//!
//! All multi-byte fields are little-endian:
//!
//! ```text
//!  0      4      8     12  13             13+K      13+K+V
//!  +------+------+------+--+---------------+---------+
//!  | size | id   | klen |op|  key (K bytes)| value...|
//!  +------+------+------+--+---------------+---------+
//! ```
//!
//! `size` is the total frame length including the 13-byte header; the
//! value length is `size - 13 - klen`. The minimum valid frame is 13
//! bytes (empty key and value).

mod conn;

use bytes::Bytes;

use crate::utils::ChunkDbError;

pub use conn::buffered;

/// Fixed frame header length in bytes; also the minimum frame size.
pub const HEADER_SIZE: usize = 13;

/// Transport accumulation buffer size.
pub(crate) const BUFFER_SIZE: usize = 2048;

/// Buffered bytes beyond this trigger an immediate flush (kept below a
/// typical MTU).
pub(crate) const BUFFER_SIZE_TRIGGER: usize = 1450;

/// Operation represents a DB operation or result, the message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Get = 0,
    Set,
    Del,
    SetOk,
    DelOk,
    GetResponse,
    GetConf,
    GetConfResponse,
    AddServerToGroup,
    AddServerToGroupAck,
    GetChunkInfo,
    GetChunkInfoResponse,
    Transfer,
    TransferCompleted,
    Err,
    Cas,
    CasOk,
    Protect,
    ProtectOk,
}

impl TryFrom<u8> for Operation {
    type Error = ChunkDbError;

    fn try_from(tag: u8) -> Result<Self, ChunkDbError> {
        use Operation::*;
        Ok(match tag {
            0 => Get,
            1 => Set,
            2 => Del,
            3 => SetOk,
            4 => DelOk,
            5 => GetResponse,
            6 => GetConf,
            7 => GetConfResponse,
            8 => AddServerToGroup,
            9 => AddServerToGroupAck,
            10 => GetChunkInfo,
            11 => GetChunkInfoResponse,
            12 => Transfer,
            13 => TransferCompleted,
            14 => Err,
            15 => Cas,
            16 => CasOk,
            17 => Protect,
            18 => ProtectOk,
            _ => {
                return Result::Err(ChunkDbError::Transport(format!(
                    "unknown operation tag {}",
                    tag
                )))
            }
        })
    }
}

/// A DB protocol message that can be sent and received over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Operation code.
    pub op: Operation,

    /// Transaction id, assigned by the sending broker and echoed back by
    /// the peer in the matching reply.
    pub id: u32,

    /// Key bytes; empty for operations without a key.
    pub key: Bytes,

    /// Value bytes; empty for operations without a value.
    pub value: Bytes,
}

impl Message {
    /// Creates a message; the id is filled in by the broker on submission.
    pub fn new(op: Operation, key: Bytes, value: Bytes) -> Self {
        Message {
            op,
            id: 0,
            key,
            value,
        }
    }

    /// Total on-wire size of this message.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    /// Serializes the message into the destination buffer. Returns the
    /// frame size and an overflow flag; when the frame does not fit the
    /// required size is reported and the buffer is left untouched.
    pub fn encode_into(&self, dest: &mut [u8]) -> (usize, bool) {
        let size = self.wire_size();
        if size > dest.len() {
            return (size, true);
        }

        dest[0..4].copy_from_slice(&(size as u32).to_le_bytes());
        dest[4..8].copy_from_slice(&self.id.to_le_bytes());
        dest[8..12].copy_from_slice(&(self.key.len() as u32).to_le_bytes());
        dest[12] = self.op as u8;
        dest[HEADER_SIZE..HEADER_SIZE + self.key.len()]
            .copy_from_slice(&self.key);
        dest[HEADER_SIZE + self.key.len()..size].copy_from_slice(&self.value);
        (size, false)
    }

    /// Unserializes a message from a complete frame (`src` must be exactly
    /// `size` bytes long). Key and value are owned copies sliced out of a
    /// single backing allocation, so the caller may recycle `src` freely.
    pub fn decode(src: &[u8]) -> Result<Message, ChunkDbError> {
        if src.len() < HEADER_SIZE {
            return Err(ChunkDbError::Transport(format!(
                "malformed frame: {} bytes, need at least {}",
                src.len(),
                HEADER_SIZE
            )));
        }

        let id = u32::from_le_bytes(src[4..8].try_into().unwrap());
        let key_size = u32::from_le_bytes(src[8..12].try_into().unwrap()) as usize;
        let op = Operation::try_from(src[12])?;

        let body = &src[HEADER_SIZE..];
        if key_size > body.len() {
            return Err(ChunkDbError::Transport(format!(
                "malformed frame: key length {} exceeds body length {}",
                key_size,
                body.len()
            )));
        }

        let owned = Bytes::copy_from_slice(body);
        Ok(Message {
            op,
            id,
            key: owned.slice(..key_size),
            value: owned.slice(key_size..),
        })
    }
}
