//! Room registry: maps `(project, file)` to live room actors.
//!
//! The registry is an ordinary value owned by the server and shared with
//! connection tasks. A room exists in the table from its first join until
//! its actor decides, under the table lock, that it is idle and has no join
//! in flight.
//!
//! ```text
//! Absent ──first join──► Active ──last leave──► Draining ──idle timeout──► Absent
//!                          ▲                        │
//!                          └────────── join ────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::CollabError;
use crate::room::{spawn_room, JoinAck, RoomCommand, RoomConfig, RoomHandle, RoomInspection, RoomJoinError, RoomKey};
use crate::session::{ConnectionSession, JoinedRoom};
use crate::storage::{MemorySnapshotStore, SnapshotStore};

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms_created: u64,
    pub rooms_evicted: u64,
    pub active_rooms: usize,
    pub snapshot_loads: u64,
    pub snapshots_persisted: u64,
    pub persist_failures: u64,
    pub merge_failures: u64,
    pub frames_dropped: u64,
}

/// Lock-free counters updated from room actors.
#[derive(Debug, Default)]
pub(crate) struct AtomicRegistryStats {
    rooms_created: AtomicU64,
    rooms_evicted: AtomicU64,
    snapshot_loads: AtomicU64,
    snapshots_persisted: AtomicU64,
    persist_failures: AtomicU64,
    merge_failures: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicRegistryStats {
    pub(crate) fn record_load(&self) {
        self.snapshot_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.snapshots_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merge_failure(&self) {
        self.merge_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared between the registry and its room actors.
pub(crate) struct RegistryShared {
    table: Mutex<HashMap<RoomKey, RoomHandle>>,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) config: RoomConfig,
    pub(crate) stats: AtomicRegistryStats,
    next_instance: AtomicU64,
}

impl RegistryShared {
    fn table(&self) -> MutexGuard<'_, HashMap<RoomKey, RoomHandle>> {
        // Entries are plain handles; a poisoned guard still holds a usable map.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove a room if it is still this instance and nobody is joining.
    pub(crate) fn try_evict(&self, key: &RoomKey, instance: u64) -> bool {
        let mut table = self.table();
        let idle = match table.get(key) {
            Some(handle) => {
                handle.instance() == instance && handle.members().load(Ordering::SeqCst) == 0
            }
            None => return true,
        };
        if idle {
            table.remove(key);
            self.stats.rooms_evicted.fetch_add(1, Ordering::Relaxed);
        }
        idle
    }

    /// Drop the table entry of a room instance that is shutting down early.
    pub(crate) fn forget(&self, key: &RoomKey, instance: u64) {
        let mut table = self.table();
        if table.get(key).is_some_and(|h| h.instance() == instance) {
            table.remove(key);
        }
    }
}

/// Creates, routes to, and retires rooms.
#[derive(Clone)]
pub struct RoomRegistry {
    shared: Arc<RegistryShared>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                table: Mutex::new(HashMap::new()),
                store,
                config,
                stats: AtomicRegistryStats::default(),
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    /// Registry over a fresh in-memory store.
    pub fn in_memory(config: RoomConfig) -> Self {
        Self::new(Arc::new(MemorySnapshotStore::new()), config)
    }

    pub fn config(&self) -> &RoomConfig {
        &self.shared.config
    }

    /// Join `session` to the room for `key`, creating the room if needed.
    ///
    /// A session already in a room leaves it first. On success the session
    /// has been sent `room_joined`, the full document state and the current
    /// awareness set.
    pub async fn join_room(
        &self,
        session: &mut ConnectionSession,
        key: RoomKey,
    ) -> Result<JoinAck, CollabError> {
        if session.room().is_some() {
            self.leave_room(session).await;
        }

        let handle = self.acquire(&key);
        let (reply, ack_rx) = oneshot::channel();
        let sent = handle
            .send(RoomCommand::Join {
                id: session.id(),
                user: session.user().clone(),
                outbound: session.outbound().clone(),
                reply,
            })
            .await;

        let ack = match (sent, ack_rx.await) {
            (true, Ok(ack)) => ack,
            _ => {
                handle.members().fetch_sub(1, Ordering::SeqCst);
                return Err(RoomJoinError::Unavailable(key.room_id()).into());
            }
        };

        session.attach(JoinedRoom { key, handle });
        Ok(ack)
    }

    /// Leave the current room. Returns `false` if the session was in none.
    pub async fn leave_room(&self, session: &mut ConnectionSession) -> bool {
        let Some(joined) = session.detach() else {
            return false;
        };
        let (reply, done) = oneshot::channel();
        if joined
            .handle
            .send(RoomCommand::Leave {
                id: session.id(),
                reply,
            })
            .await
        {
            let _ = done.await;
        }
        true
    }

    /// Existing live room for `key`, or a newly spawned one. Counts the
    /// caller as a pending member before the table lock is released.
    fn acquire(&self, key: &RoomKey) -> RoomHandle {
        let mut table = self.shared.table();
        if let Some(handle) = table.get(key) {
            if !handle.is_closed() {
                handle.members().fetch_add(1, Ordering::SeqCst);
                return handle.clone();
            }
            log::warn!("Room {key} actor is gone, replacing it");
        }

        let instance = self.shared.next_instance.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_room(key.clone(), instance, self.shared.clone());
        handle.members().fetch_add(1, Ordering::SeqCst);
        table.insert(key.clone(), handle.clone());
        self.shared.stats.rooms_created.fetch_add(1, Ordering::Relaxed);
        log::info!("Created room {key}");
        handle
    }

    pub fn room_count(&self) -> usize {
        self.shared.table().len()
    }

    pub fn contains(&self, key: &RoomKey) -> bool {
        self.shared.table().contains_key(key)
    }

    pub fn active_rooms(&self) -> Vec<RoomKey> {
        self.shared.table().keys().cloned().collect()
    }

    /// Ask a live room for its current state.
    pub async fn inspect(&self, key: &RoomKey) -> Option<RoomInspection> {
        let handle = self.shared.table().get(key).cloned()?;
        handle.inspect().await
    }

    /// Close every room, flushing final snapshots.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = self.shared.table().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let (reply, done) = oneshot::channel();
            if handle.send(RoomCommand::Shutdown { reply }).await {
                let _ = done.await;
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let s = &self.shared.stats;
        RegistryStats {
            rooms_created: s.rooms_created.load(Ordering::Relaxed),
            rooms_evicted: s.rooms_evicted.load(Ordering::Relaxed),
            active_rooms: self.room_count(),
            snapshot_loads: s.snapshot_loads.load(Ordering::Relaxed),
            snapshots_persisted: s.snapshots_persisted.load(Ordering::Relaxed),
            persist_failures: s.persist_failures.load(Ordering::Relaxed),
            merge_failures: s.merge_failures.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
