//! Customized unified error type.

use std::io;
use std::net;

use thiserror::Error;

/// Customized error type for ChunkDB client operations.
#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum ChunkDbError {
    /// Dial failure, socket read/write failure, or a malformed frame.
    /// Fatal to the connection it occurred on.
    #[error("transport error: {0}")]
    Transport(String),

    /// Per-request deadline elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,

    /// The request was pending when its connection broker shut down, or
    /// was submitted after the shutdown.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer answered with an `Err` frame; carries its diagnostic.
    #[error("server error: {0}")]
    Remote(String),

    /// The peer answered with an operation code that is not a valid
    /// response to the submitted request.
    #[error("unexpected response operation code: {0}")]
    UnexpectedResponse(u8),

    /// No usable holder for the target chunk.
    #[error("no reachable holder")]
    Unreachable,

    /// Invalid configuration string or cluster descriptor.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Programming error on the caller side (e.g. a zero-timeout
    /// request expecting a reply).
    #[error("{0}")]
    Internal(String),
}

impl ChunkDbError {
    /// Creates an `Internal` error from anything printable.
    pub fn msg(msg: impl ToString) -> Self {
        ChunkDbError::Internal(msg.to_string())
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from common foreign error types, keeping only their string
// representation.
macro_rules! impl_from_error {
    ($error:ty, $variant:ident) => {
        impl From<$error> for ChunkDbError {
            fn from(e: $error) -> Self {
                ChunkDbError::$variant(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error, Transport);
impl_from_error!(net::AddrParseError, Config);
impl_from_error!(rmp_serde::encode::Error, Config);
impl_from_error!(rmp_serde::decode::Error, Config);
impl_from_error!(toml::ser::Error, Config);
impl_from_error!(toml::de::Error, Config);
