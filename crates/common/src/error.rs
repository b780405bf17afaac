//! Common error types for the director components.

use std::fmt;

/// A specialized Result type for director operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for director operations.
///
/// Invariant violations inside the destination merger (stale handles,
/// over-withdrawal) are deliberately not represented here: they indicate a
/// projector bug and abort the process instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("kernel rejected request: errno {errno}")]
    KernelReject { errno: i32 },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("dump interrupted: {0}")]
    DumpInterrupted(String),

    #[error("incomplete service identity")]
    IncompleteIdentity,

    #[error("unsupported address family {0}")]
    UnsupportedAf(u16),

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new netlink error.
    pub fn netlink(msg: impl fmt::Display) -> Self {
        Error::Netlink(msg.to_string())
    }

    /// Create a new decode error.
    pub fn decode(msg: impl fmt::Display) -> Self {
        Error::Decode(msg.to_string())
    }

    /// Create a new timeout error.
    pub fn timeout(msg: impl fmt::Display) -> Self {
        Error::Timeout(msg.to_string())
    }

    /// Create a new bad-address error.
    pub fn bad_address(msg: impl fmt::Display) -> Self {
        Error::BadAddress(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Whether the transport must be considered collapsed.
    ///
    /// Fatal errors require reopening the netlink socket and replaying the
    /// desired state from a flushed kernel; everything else is a per-event
    /// failure the reconciler logs and survives.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Netlink(_) | Error::Timeout(_))
    }
}
