//! In-process snapshot store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{PersistedSnapshot, SnapshotStore, StoreError};

type RowKey = (String, String);

/// Snapshot store backed by a `HashMap`. Contents die with the process.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rows: Mutex<HashMap<RowKey, PersistedSnapshot>>,
    loads: AtomicU64,
    writes: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load_latest` calls served.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of successful `upsert` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(room_id: &str, doc_name: &str) -> RowKey {
        (room_id.to_string(), doc_name.to_string())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load_latest(&self, room_id: &str, doc_name: &str) -> Result<Option<PersistedSnapshot>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(rows.get(&Self::key(room_id, doc_name)).cloned())
    }

    fn upsert(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        rows.insert(Self::key(&snapshot.room_id, &snapshot.doc_name), snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, room_id: &str, doc_name: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(rows.remove(&Self::key(room_id, doc_name)).is_some())
    }
}
