//! Durable snapshot storage.
//!
//! One row per `(room_id, doc_name)` holds the latest converged state of a
//! room. Rows are overwritten (last writer wins) and carry a version that the
//! room increments on every write.
//!
//! Backends:
//! - [`RocksSnapshotStore`]: RocksDB, LZ4-compressed JSON rows.
//! - [`MemorySnapshotStore`]: in-process map, for ephemeral servers and tests.
//!
//! Stores are synchronous; rooms call them from the blocking pool.

pub mod memory;
pub mod rocks;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, StoreConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{DocumentError, Origin, ReplicatedDocument};
use crate::protocol::{base64_bytes, now_millis};

/// Storage errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Latest persisted state of one room document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub room_id: String,
    pub doc_name: String,
    #[serde(with = "base64_bytes")]
    pub state_vector: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub document_update: Vec<u8>,
    pub version: u64,
    /// `true` for the final flush written when a room is evicted.
    pub is_snapshot: bool,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl PersistedSnapshot {
    /// Capture the full state of `doc`.
    pub fn capture(
        room_id: impl Into<String>,
        doc_name: impl Into<String>,
        doc: &ReplicatedDocument,
        version: u64,
        is_snapshot: bool,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            doc_name: doc_name.into(),
            state_vector: doc.current_vector(),
            document_update: doc.encode_full(),
            version,
            is_snapshot,
            updated_at: now_millis(),
        }
    }

    /// Replay into an existing (normally fresh) document.
    pub fn restore_into(&self, doc: &ReplicatedDocument) -> Result<(), DocumentError> {
        if !self.document_update.is_empty() {
            doc.apply_delta(&self.document_update, Origin::InitialSync)?;
        }
        Ok(())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Durable home of room snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Most recent snapshot for the document, if one was ever written.
    fn load_latest(&self, room_id: &str, doc_name: &str) -> Result<Option<PersistedSnapshot>, StoreError>;

    /// Insert or overwrite the single row for `(room_id, doc_name)`.
    fn upsert(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError>;

    /// Remove the row. Returns whether one existed.
    fn delete(&self, room_id: &str, doc_name: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::decoder::Decode;

    #[test]
    fn test_capture_and_restore() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "persist me").unwrap();

        let snap = PersistedSnapshot::capture("p/f", "content", &doc, 3, false);
        assert_eq!(snap.version, 3);
        assert!(!snap.is_snapshot);

        let fresh = ReplicatedDocument::new();
        snap.restore_into(&fresh).unwrap();
        assert_eq!(fresh.content(), "persist me");
        assert_eq!(
            yrs::StateVector::decode_v1(&fresh.current_vector()).unwrap(),
            yrs::StateVector::decode_v1(&snap.state_vector).unwrap()
        );
    }

    #[test]
    fn test_row_json_shape() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "x").unwrap();
        let snap = PersistedSnapshot::capture("p/f", "content", &doc, 1, true);

        let json: serde_json::Value =
            serde_json::from_slice(&snap.to_json_bytes().unwrap()).unwrap();
        assert_eq!(json["roomId"], "p/f");
        assert_eq!(json["docName"], "content");
        assert_eq!(json["version"], 1);
        assert_eq!(json["isSnapshot"], true);
        assert!(json["documentUpdate"].is_string());
        assert!(json["stateVector"].is_string());

        let back = PersistedSnapshot::from_json_bytes(&snap.to_json_bytes().unwrap()).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_row_rejects_garbage() {
        assert!(matches!(
            PersistedSnapshot::from_json_bytes(b"{oops"),
            Err(StoreError::Deserialization(_))
        ));
    }
}
