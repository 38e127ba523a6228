//! Crate-level error type.
//!
//! Each layer has its own error enum; `CollabError` wraps them so callers
//! crossing layers (gateway, client) can use `?` throughout.

use thiserror::Error;

use crate::auth::AuthError;
use crate::awareness::AwarenessError;
use crate::document::DocumentError;
use crate::offline::OfflineError;
use crate::protocol::ProtocolError;
use crate::room::RoomJoinError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Socket closed with policy violation; never retried.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("cannot join room: {0}")]
    RoomJoin(#[from] RoomJoinError),

    /// Logged and counted; collaboration continues in memory.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("merge failed: {0}")]
    Merge(#[from] DocumentError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("awareness error: {0}")]
    Awareness(#[from] AwarenessError),

    #[error("offline cache error: {0}")]
    Offline(#[from] OfflineError),

    /// The connection dropped or could not be established.
    #[error("network error: {0}")]
    NetworkDrop(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::NetworkDrop(e.to_string())
    }
}

impl CollabError {
    /// Whether a client should go offline and retry.
    pub fn is_network(&self) -> bool {
        matches!(self, CollabError::NetworkDrop(_) | CollabError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_message() {
        let err: CollabError = RoomJoinError::MissingRoom.into();
        assert!(err.to_string().contains("no room specified"));

        let err: CollabError = StoreError::Database("disk full".into()).into();
        assert!(err.to_string().contains("disk full"));
        assert!(!err.is_network());
    }

    #[test]
    fn test_network_classification() {
        assert!(CollabError::NetworkDrop("reset".into()).is_network());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(CollabError::from(io).is_network());
    }
}
