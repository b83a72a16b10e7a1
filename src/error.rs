//! Crate-wide error taxonomy

use thiserror::Error;

/// Errors surfaced by the overlay core.
///
/// Frame-level variants (`Malformed`, `BadSignature`, `ReplayOrStale`,
/// `CryptoKeyMismatch`, `AuthFailed`) are logged and the offending frame is
/// dropped; they never cross the public API. `UnknownPeer` is returned to
/// callers of `send`. `Config` aborts node construction.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed data: {0}")]
    Malformed(&'static str),

    #[error("invalid message signature")]
    BadSignature,

    #[error("stale or replayed sequence")]
    ReplayOrStale,

    #[error("unknown peer")]
    UnknownPeer,

    #[error("key agreement destination mismatch")]
    CryptoKeyMismatch,

    #[error("authenticated decryption failed")]
    AuthFailed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
