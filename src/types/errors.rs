//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The enum is
//! `Clone` so one connection-level failure can be delivered to every pending
//! call; I/O errors are shared behind an `Arc` for that reason.

use std::sync::Arc;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for minirpc.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bad magic number, unknown codec tag or malformed options frame.
    /// Connection fatal; nothing is written back to the peer.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// A header or body frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A header or body could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// The client is closing or closed, or the codec was already shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// Call-scoped failure reported by the server in `Header.error`.
    #[error("{0}")]
    Invocation(String),

    /// Invalid service or method definition, caught at setup time.
    #[error("registration error: {0}")]
    Registration(String),

    /// Transport I/O errors.
    #[error("io error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

// Convenience constructors
impl Error {
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::Invocation(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    /// True for [`Error::Shutdown`].
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}
