use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure a node can observe, locally or from a peer.
///
/// Derives serde so a remote handler's `Result<T, Error>` travels back to the
/// caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    #[error("peer {address} is unreachable: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("ring corruption detected: {0}")]
    RingCorruption(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("node is leaving the ring")]
    Leaving,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("server error: {0}")]
    Server(String),
}

impl Error {
    pub fn unreachable(address: &str, reason: impl ToString) -> Error {
        Error::PeerUnreachable {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors that mean "treat this peer as dead" for repair purposes.
    pub fn is_peer_failure(&self) -> bool {
        matches!(self, Error::PeerUnreachable { .. } | Error::Leaving)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
