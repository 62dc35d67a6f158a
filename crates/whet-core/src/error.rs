use std::fmt::Display;

use thiserror::Error;

/// Error taxonomy for the tunnel engine.
///
/// Startup-time errors (`Config`) abort the owning process. Signaling errors
/// map to a single HTTP error response. Per-session runtime errors are never
/// surfaced to the remote end; they trigger an orderly local close which the
/// peer observes as channel/peer closure.
#[derive(Debug, Error)]
pub enum WhetError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unauthorized")]
    Auth,

    #[error("unknown or invalid target: {0}")]
    Target(String),

    #[error("signaling failed: {0}")]
    Signaling(String),

    #[error("forward dial failed: {0}")]
    Dial(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("session closed")]
    Closed,
}

impl WhetError {
    pub(crate) fn signaling(err: impl Display) -> Self {
        WhetError::Signaling(err.to_string())
    }

    pub(crate) fn transport(err: impl Display) -> Self {
        WhetError::Transport(err.to_string())
    }
}
