//! Error types for patchbay connection operations.

use patchbay_proto::{EncodeError, WireError};

/// Alias for `Result<T, patchbay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by patchbay calls and connection management.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Message construction was rejected; nothing was sent.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The frame codec rejected data going onto or coming off the wire.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// An I/O error from the underlying byte pipe.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The connection failed or was closed while a call was outstanding.
    #[error("connection closed while call was outstanding")]
    Disconnected,

    /// The peer's dispatcher reported a failed call: the operation did not
    /// run (or refused the call) and had no partial effect.
    #[error("remote dispatch failed: {message}")]
    Remote {
        /// Failure description produced by the peer.
        message: String,
    },
}
