//! Error types for the network file protocol.

use std::io;

use thiserror::Error;

/// Result type for protocol, transport and client operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur anywhere between the socket and the local cache.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error on the socket or the local filesystem.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection (read returned zero bytes, or the multiplexer shut down).
    #[error("connection closed")]
    ConnectionClosed,

    /// A single send call did not write the whole buffer.
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    /// Header magic matched neither the expected value nor its byte swap.
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    /// Zero-length payloads are never valid messages.
    #[error("empty payload")]
    EmptyPayload,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    /// Payload CRC32 does not match the header.
    #[error("checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Payload could not be decoded into the expected structure.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A second thread tried to wait on a channel that already has a waiter.
    #[error("channel {0} already has a blocked receiver")]
    ConcurrentReceive(u32),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Bootstrap handshake or validation failed; the client is unusable.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Local cache no longer matches what the server sent. Continuing would serve wrong content.
    #[error("fatal consistency error: {0}")]
    Fatal(String),
}

impl NetError {
    /// Protocol integrity failures: bug or corrupted stream, always logged as errors.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            NetError::InvalidMagic { .. }
                | NetError::EmptyPayload
                | NetError::PayloadTooLarge { .. }
                | NetError::ChecksumMismatch { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, NetError::Fatal(_) | NetError::Handshake(_))
    }
}

impl From<NetError> for io::Error {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Io(inner) => inner,
            NetError::ConnectionClosed => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            other => io::Error::other(other),
        }
    }
}
