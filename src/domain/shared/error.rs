//! Domain errors

use thiserror::Error;

use crate::infrastructure::media::MediaError;
use crate::infrastructure::signaling::SignalingError;

/// Domain result type
pub type Result<T> = std::result::Result<T, CallError>;

#[derive(Error, Debug)]
pub enum CallError {
    /// No codec overlap or missing audio media. Local and non-fatal: the
    /// caller may retry with different preferences or hang up.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid operation: {0}")]
    InvalidState(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Transfer request rejected at the protocol boundary. No call state
    /// was mutated.
    #[error("transfer rejected ({status}): {detail}")]
    TransferRejected { status: u16, detail: String },

    /// Non-2xx final response from the peer.
    #[error("peer rejected with status {0}")]
    PeerFailure(u16),

    #[error("directory rejected entity: {0}")]
    Directory(String),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Media(#[from] MediaError),
}
