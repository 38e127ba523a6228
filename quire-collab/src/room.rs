//! One live room: a document, its presence map and its connections.
//!
//! Each room is a single actor task that owns all of its state and
//! processes [`RoomCommand`]s one at a time:
//!
//! ```text
//! sessions ── RoomHandle (mpsc) ──► RoomActor ──┬── ReplicatedDocument ── events ──┐
//!                                               ├── AwarenessStore                 │
//!                                               └── connections ◄── fan-out ◄──────┘
//!                                                        │
//!                                          watch (latest snapshot wins)
//!                                                        ▼
//!                                     persistence worker ── spawn_blocking ── SnapshotStore
//! ```
//!
//! Lifecycle: the actor loads the stored snapshot before serving any command,
//! schedules an epoch-tagged cleanup check whenever it becomes empty, and only
//! exits if the registry agrees (under its table lock) that no join is pending.
//! A room whose snapshot cannot be read never serves: it refuses its queued
//! joins and leaves the table without writing anything.
//!
//! A connection whose queue was full when a sync frame went out is marked
//! stale. It gets no further deltas until a full-state frame fits in its
//! queue, retried every [`RESYNC_RETRY`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::AuthenticatedUser;
use crate::awareness::{AwarenessPayload, AwarenessStore, CursorPosition};
use crate::document::{DocumentUpdate, Origin, ReplicatedDocument, CONTENT_FIELD};
use crate::error::CollabError;
use crate::protocol::{
    encode_awareness_frame, encode_sync_frame, ControlEnvelope, ControlMessage, ErrorCode,
};
use crate::registry::RegistryShared;
use crate::session::{ConnectionId, Outbound, OutboundSender};
use crate::storage::{PersistedSnapshot, SnapshotStore, StoreError};

/// Longest accepted project or file id.
pub const MAX_ID_LEN: usize = 128;

/// Delay between attempts to resync a stale connection.
pub const RESYNC_RETRY: Duration = Duration::from_millis(50);

// ───────────────────────────────────────────────────────────────────
// Keys
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomJoinError {
    #[error("invalid {field}: {reason}")]
    InvalidId { field: &'static str, reason: String },
    #[error("no room specified")]
    MissingRoom,
    #[error("room {0} is not accepting joins")]
    Unavailable(String),
}

/// Identifies a room: one file of one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    project_id: String,
    file_id: String,
}

impl RoomKey {
    pub fn new(project_id: impl Into<String>, file_id: impl Into<String>) -> Result<Self, RoomJoinError> {
        let project_id = project_id.into();
        let file_id = file_id.into();
        validate_id("projectId", &project_id)?;
        validate_id("fileId", &file_id)?;
        Ok(Self { project_id, file_id })
    }

    /// Parse a `"project/file"` room id.
    pub fn parse(room_id: &str) -> Result<Self, RoomJoinError> {
        let (project, file) = room_id.split_once('/').ok_or_else(|| RoomJoinError::InvalidId {
            field: "roomId",
            reason: "expected 'projectId/fileId'".into(),
        })?;
        Self::new(project, file)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn room_id(&self) -> String {
        format!("{}/{}", self.project_id, self.file_id)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.file_id)
    }
}

fn validate_id(field: &'static str, id: &str) -> Result<(), RoomJoinError> {
    let reason = if id.is_empty() {
        "must not be empty".to_string()
    } else if id.len() > MAX_ID_LEN {
        format!("longer than {MAX_ID_LEN} characters")
    } else if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        format!("contains forbidden character {c:?}")
    } else {
        return Ok(());
    };
    Err(RoomJoinError::InvalidId { field, reason })
}

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Per-room tuning.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long an empty room waits before it is evicted.
    pub idle_timeout: Duration,
    /// Minimum gap between forwarded cursor moves of one connection.
    pub cursor_throttle: Duration,
    /// Name under which the shared text is persisted.
    pub doc_name: String,
    /// Queued commands per room.
    pub command_capacity: usize,
    /// Reads of the stored snapshot before the room refuses to open.
    pub load_attempts: u32,
    /// Pause between failed snapshot reads.
    pub load_retry: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            cursor_throttle: Duration::from_millis(100),
            doc_name: CONTENT_FIELD.to_string(),
            command_capacity: 1024,
            load_attempts: 3,
            load_retry: Duration::from_millis(100),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Commands & handle
// ───────────────────────────────────────────────────────────────────

/// Reply to a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    pub room_id: String,
    /// Connections in the room, including the joiner.
    pub connections: usize,
}

/// Point-in-time view of a room, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInspection {
    pub content: String,
    pub connections: usize,
    pub awareness_entries: usize,
    pub version: u64,
}

pub(crate) enum RoomCommand {
    Join {
        id: ConnectionId,
        user: AuthenticatedUser,
        outbound: OutboundSender,
        reply: oneshot::Sender<JoinAck>,
    },
    Leave {
        id: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    Update {
        from: ConnectionId,
        delta: Vec<u8>,
    },
    Awareness {
        from: ConnectionId,
        payload: Vec<u8>,
    },
    CursorMove {
        from: ConnectionId,
        cursor: Option<CursorPosition>,
    },
    SyncRequest {
        from: ConnectionId,
        state_vector: Vec<u8>,
    },
    CleanupCheck {
        epoch: u64,
    },
    ResyncCheck,
    CursorFlush {
        from: ConnectionId,
    },
    Inspect {
        reply: oneshot::Sender<RoomInspection>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable address of a room actor.
#[derive(Clone)]
pub struct RoomHandle {
    key: RoomKey,
    instance: u64,
    tx: mpsc::Sender<RoomCommand>,
    members: Arc<AtomicUsize>,
}

impl fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomHandle")
            .field("key", &self.key)
            .field("instance", &self.instance)
            .field("members", &self.members.load(Ordering::SeqCst))
            .finish()
    }
}

impl RoomHandle {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    /// Members registered or pending.
    pub(crate) fn members(&self) -> &Arc<AtomicUsize> {
        &self.members
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) async fn send(&self, command: RoomCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    pub async fn update(&self, from: ConnectionId, delta: Vec<u8>) -> bool {
        self.send(RoomCommand::Update { from, delta }).await
    }

    pub async fn awareness(&self, from: ConnectionId, payload: Vec<u8>) -> bool {
        self.send(RoomCommand::Awareness { from, payload }).await
    }

    pub async fn cursor_move(&self, from: ConnectionId, cursor: Option<CursorPosition>) -> bool {
        self.send(RoomCommand::CursorMove { from, cursor }).await
    }

    pub async fn sync_request(&self, from: ConnectionId, state_vector: Vec<u8>) -> bool {
        self.send(RoomCommand::SyncRequest { from, state_vector }).await
    }

    pub async fn inspect(&self) -> Option<RoomInspection> {
        let (reply, rx) = oneshot::channel();
        if !self.send(RoomCommand::Inspect { reply }).await {
            return None;
        }
        rx.await.ok()
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

struct Member {
    user: AuthenticatedUser,
    outbound: OutboundSender,
    /// A sync frame was dropped; deltas are withheld until full state is queued.
    needs_resync: bool,
    last_cursor_fanout: Option<Instant>,
    /// Latest cursor that arrived inside the throttle window.
    held_cursor: Option<Option<CursorPosition>>,
}

pub(crate) struct RoomActor {
    key: RoomKey,
    room_id: String,
    instance: u64,
    rx: mpsc::Receiver<RoomCommand>,
    self_tx: mpsc::WeakSender<RoomCommand>,
    members: Arc<AtomicUsize>,
    shared: Arc<RegistryShared>,

    doc: ReplicatedDocument,
    doc_events: broadcast::Receiver<DocumentUpdate>,
    awareness: AwarenessStore,
    connections: HashMap<ConnectionId, Member>,

    epoch: u64,
    version: u64,
    last_activity: Instant,
    resync_scheduled: bool,
    persist_tx: watch::Sender<Option<PersistedSnapshot>>,
    persist_worker: Option<JoinHandle<()>>,
}

/// Create a room actor and return its handle. The actor is not running yet.
pub(crate) fn spawn_room(key: RoomKey, instance: u64, shared: Arc<RegistryShared>) -> RoomHandle {
    let (tx, rx) = mpsc::channel(shared.config.command_capacity.max(1));
    let members = Arc::new(AtomicUsize::new(0));
    let doc = ReplicatedDocument::new();
    let doc_events = doc.subscribe();
    let room_id = key.room_id();

    let (persist_tx, persist_rx) = watch::channel(None);
    let persist_worker = tokio::spawn(persist_loop(
        shared.store.clone(),
        persist_rx,
        shared.clone(),
        room_id.clone(),
    ));

    let actor = RoomActor {
        key: key.clone(),
        room_id,
        instance,
        rx,
        self_tx: tx.downgrade(),
        members: members.clone(),
        shared,
        doc,
        doc_events,
        awareness: AwarenessStore::new(),
        connections: HashMap::new(),
        epoch: 0,
        version: 0,
        last_activity: Instant::now(),
        resync_scheduled: false,
        persist_tx,
        persist_worker: Some(persist_worker),
    };
    tokio::spawn(actor.run());

    RoomHandle {
        key,
        instance,
        tx,
        members,
    }
}

impl RoomActor {
    async fn run(mut self) {
        if let Err(e) = self.load_snapshot().await {
            log::error!("Room {} cannot read its snapshot, refusing joins: {e}", self.room_id);
            self.abandon().await;
            return;
        }
        log::info!("Room {} active (instance {})", self.room_id, self.instance);

        let mut shutdown_reply = None;
        while let Some(command) = self.rx.recv().await {
            match command {
                RoomCommand::CleanupCheck { epoch } => {
                    if self.cleanup_due(epoch) {
                        break;
                    }
                }
                RoomCommand::Shutdown { reply } => {
                    shutdown_reply = Some(reply);
                    break;
                }
                other => self.handle(other),
            }
            self.drain_document_events();
        }

        self.rx.close();
        self.finish().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Replay the stored snapshot before any traffic is accepted, retrying
    /// failed reads up to `load_attempts` times.
    async fn load_snapshot(&mut self) -> Result<(), CollabError> {
        let attempts = self.shared.config.load_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.read_snapshot().await {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "Room {} snapshot read {attempt}/{attempts} failed: {e}",
                        self.room_id
                    );
                    attempt += 1;
                    tokio::time::sleep(self.shared.config.load_retry).await;
                }
                Err(e) => return Err(e),
            }
        }

        // Events from the replay are not fanned out or re-persisted.
        while self.doc_events.try_recv().is_ok() {}
        Ok(())
    }

    async fn read_snapshot(&mut self) -> Result<(), CollabError> {
        let store = self.shared.store.clone();
        let room_id = self.room_id.clone();
        let doc_name = self.shared.config.doc_name.clone();
        self.shared.stats.record_load();

        let loaded = tokio::task::spawn_blocking(move || store.load_latest(&room_id, &doc_name))
            .await
            .map_err(|e| StoreError::Database(format!("load task failed: {e}")))
            .and_then(|result| result);
        let snapshot = match loaded {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                log::debug!("Room {} has no stored snapshot", self.room_id);
                return Ok(());
            }
            Err(e) => {
                self.shared.stats.record_persist_failure();
                return Err(e.into());
            }
        };

        snapshot.restore_into(&self.doc)?;
        self.version = snapshot.version;
        log::info!(
            "Room {} restored snapshot v{} ({} bytes)",
            self.room_id,
            snapshot.version,
            snapshot.document_update.len()
        );
        Ok(())
    }

    /// Leave the table without serving or persisting anything. Queued joins
    /// are dropped unanswered and fail as unavailable.
    async fn abandon(mut self) {
        self.shared.forget(&self.key, self.instance);
        self.rx.close();
        let RoomActor {
            persist_tx,
            persist_worker,
            room_id,
            ..
        } = self;
        drop(persist_tx);
        if let Some(worker) = persist_worker {
            let _ = worker.await;
        }
        log::warn!("Room {room_id} abandoned");
    }

    fn handle(&mut self, command: RoomCommand) {
        self.last_activity = Instant::now();
        match command {
            RoomCommand::Join { id, user, outbound, reply } => {
                self.on_join(id, user, outbound, reply);
            }
            RoomCommand::Leave { id, reply } => {
                self.on_leave(id);
                let _ = reply.send(());
            }
            RoomCommand::Update { from, delta } => self.on_update(from, &delta),
            RoomCommand::Awareness { from, payload } => self.on_awareness(from, &payload),
            RoomCommand::CursorMove { from, cursor } => self.on_cursor(from, cursor),
            RoomCommand::SyncRequest { from, state_vector } => {
                self.on_sync_request(from, &state_vector);
            }
            RoomCommand::ResyncCheck => {
                self.resync_scheduled = false;
                self.resync_stale();
            }
            RoomCommand::CursorFlush { from } => self.flush_cursor(from),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(RoomInspection {
                    content: self.doc.content(),
                    connections: self.connections.len(),
                    awareness_entries: self.awareness.len(),
                    version: self.version,
                });
            }
            RoomCommand::CleanupCheck { .. } | RoomCommand::Shutdown { .. } => {}
        }
    }

    // ─── Membership ───────────────────────────────────────────────────

    fn on_join(
        &mut self,
        id: ConnectionId,
        user: AuthenticatedUser,
        outbound: OutboundSender,
        reply: oneshot::Sender<JoinAck>,
    ) {
        // A pending cleanup must not fire on a room that was rejoined.
        self.epoch += 1;
        self.awareness.join(id, &user);
        log::info!("{} ({id}) joined room {}", user.display_name, self.room_id);

        // The initial full state goes out through the resync path.
        self.connections.insert(
            id,
            Member {
                user,
                outbound: outbound.clone(),
                needs_resync: true,
                last_cursor_fanout: None,
                held_cursor: None,
            },
        );

        let connections = self.connections.len();
        let joined = ControlEnvelope::new(ControlMessage::RoomJoined {
            project_id: self.key.project_id().to_string(),
            file_id: self.key.file_id().to_string(),
            connections,
        })
        .with_room(&self.room_id)
        .with_client(id);
        self.deliver(&outbound, Outbound::Control(joined));
        self.resync_stale();
        self.broadcast_awareness(None);

        let _ = reply.send(JoinAck {
            room_id: self.room_id.clone(),
            connections,
        });
    }

    fn on_leave(&mut self, id: ConnectionId) {
        let Some(member) = self.connections.remove(&id) else {
            return;
        };
        self.members.fetch_sub(1, Ordering::SeqCst);
        log::info!("{} ({id}) left room {}", member.user.display_name, self.room_id);

        if self.awareness.remove_connection(id).is_some() {
            self.broadcast_awareness(None);
        }

        if self.connections.is_empty() {
            self.epoch += 1;
            self.schedule_cleanup();
        }
    }

    fn schedule_cleanup(&self) {
        let delay = self.shared.config.idle_timeout;
        log::debug!("Room {} empty, cleanup check in {delay:?}", self.room_id);
        self.schedule(delay, RoomCommand::CleanupCheck { epoch: self.epoch });
    }

    /// Send `command` to this room after `delay`, unless it is gone by then.
    fn schedule(&self, delay: Duration, command: RoomCommand) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(command).await;
            }
        });
    }

    /// Whether the room should shut down now.
    fn cleanup_due(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || !self.connections.is_empty() {
            log::debug!("Room {} cleanup check {epoch} is stale", self.room_id);
            return false;
        }
        if self.shared.try_evict(&self.key, self.instance) {
            log::info!(
                "Room {} evicted after {:?} idle",
                self.room_id,
                self.last_activity.elapsed()
            );
            true
        } else {
            log::debug!("Room {} has a pending join, staying up", self.room_id);
            false
        }
    }

    // ─── Traffic ──────────────────────────────────────────────────────

    fn on_update(&mut self, from: ConnectionId, delta: &[u8]) {
        if !self.connections.contains_key(&from) {
            log::warn!("Room {} ignoring update from non-member {from}", self.room_id);
            return;
        }
        if let Err(e) = self.doc.apply_delta(delta, Origin::Remote { from }) {
            self.shared.stats.record_merge_failure();
            log::warn!("Room {} rejected delta from {from}: {e}", self.room_id);
            self.send_error(from, ErrorCode::MergeFailed, e.to_string());
        }
    }

    fn on_awareness(&mut self, from: ConnectionId, payload: &[u8]) {
        if !self.connections.contains_key(&from) {
            return;
        }
        let submitted = match AwarenessPayload::decode(payload) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Room {} bad awareness from {from}: {e}", self.room_id);
                self.send_error(from, ErrorCode::MalformedMessage, e.to_string());
                return;
            }
        };
        let entry = submitted
            .get(from)
            .or_else(|| submitted.entries.first())
            .cloned();
        if let Some(entry) = entry {
            if self.awareness.apply_client_entry(from, &entry) {
                self.broadcast_awareness(Some(from));
            }
        }
    }

    fn on_cursor(&mut self, from: ConnectionId, cursor: Option<CursorPosition>) {
        if !self.awareness.update_cursor(from, cursor) {
            return;
        }
        let throttle = self.shared.config.cursor_throttle;
        let now = Instant::now();
        let Some(member) = self.connections.get_mut(&from) else {
            return;
        };
        if let Some(last) = member.last_cursor_fanout {
            let elapsed = now.duration_since(last);
            if elapsed < throttle {
                log::trace!("Room {} holding throttled cursor from {from}", self.room_id);
                let first_held = member.held_cursor.replace(cursor).is_none();
                if first_held {
                    self.schedule(throttle - elapsed, RoomCommand::CursorFlush { from });
                }
                return;
            }
        }
        member.last_cursor_fanout = Some(now);
        member.held_cursor = None;
        self.fan_out_cursor(from, cursor);
    }

    /// Forward the last cursor held back by the throttle.
    fn flush_cursor(&mut self, from: ConnectionId) {
        let Some(member) = self.connections.get_mut(&from) else {
            return;
        };
        let Some(cursor) = member.held_cursor.take() else {
            return;
        };
        member.last_cursor_fanout = Some(Instant::now());
        self.fan_out_cursor(from, cursor);
    }

    fn fan_out_cursor(&self, from: ConnectionId, cursor: Option<CursorPosition>) {
        let envelope = ControlEnvelope::new(ControlMessage::CursorMove { cursor })
            .with_room(&self.room_id)
            .with_client(from);
        self.fan_out(Outbound::Control(envelope), Some(from));
    }

    fn on_sync_request(&mut self, from: ConnectionId, state_vector: &[u8]) {
        match self.doc.encode_delta(state_vector) {
            Ok(update) => {
                let response = ControlEnvelope::new(ControlMessage::SyncResponse {
                    update,
                    state_vector: self.doc.current_vector(),
                })
                .with_room(&self.room_id)
                .with_client(from);
                if let Some(member) = self.connections.get(&from) {
                    let outbound = member.outbound.clone();
                    self.deliver(&outbound, Outbound::Control(response));
                }
            }
            Err(e) => self.send_error(from, ErrorCode::MalformedMessage, e.to_string()),
        }
    }

    /// Fan out merged updates and queue persistence.
    fn drain_document_events(&mut self) {
        let mut dirty = false;
        loop {
            match self.doc_events.try_recv() {
                Ok(event) => {
                    if !event.changed {
                        continue;
                    }
                    dirty = true;
                    match event.origin {
                        Origin::Remote { from } => self.fan_out_sync(&event.delta, Some(from)),
                        Origin::Local => self.fan_out_sync(&event.delta, None),
                        Origin::InitialSync => {}
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    // Skipped deltas never reach anyone; everyone needs full state.
                    log::warn!("Room {} lagged {n} document events", self.room_id);
                    for member in self.connections.values_mut() {
                        member.needs_resync = true;
                    }
                    self.resync_stale();
                    dirty = true;
                }
                Err(_) => break,
            }
        }
        if dirty {
            self.queue_persist(false);
        }
    }

    fn queue_persist(&mut self, is_snapshot: bool) {
        self.version += 1;
        let snapshot = PersistedSnapshot::capture(
            self.room_id.clone(),
            self.shared.config.doc_name.clone(),
            &self.doc,
            self.version,
            is_snapshot,
        );
        self.persist_tx.send_replace(Some(snapshot));
    }

    // ─── Delivery ─────────────────────────────────────────────────────

    fn broadcast_awareness(&self, except: Option<ConnectionId>) {
        match self.awareness.encode_state() {
            Ok(state) => {
                let frame = Arc::new(encode_awareness_frame(&state));
                self.fan_out(Outbound::Binary(frame), except);
            }
            Err(e) => log::error!("Room {} awareness encode failed: {e}", self.room_id),
        }
    }

    /// Send a merged delta to every up-to-date member except `except`. A
    /// member whose queue is full misses it and is marked stale.
    fn fan_out_sync(&mut self, delta: &[u8], except: Option<ConnectionId>) {
        let frame = Arc::new(encode_sync_frame(delta));
        let mut dropped = false;
        for (id, member) in self.connections.iter_mut() {
            if Some(*id) == except || member.needs_resync {
                continue;
            }
            if !member.outbound.offer(Outbound::Binary(frame.clone())) {
                self.shared.stats.record_dropped_frame();
                log::debug!("Room {} dropped a delta for {id}, marking it stale", self.room_id);
                member.needs_resync = true;
                dropped = true;
            }
        }
        if dropped {
            self.schedule_resync();
        }
    }

    /// Queue the full document to every stale member with room for it.
    fn resync_stale(&mut self) {
        let mut full = None;
        let mut waiting = false;
        for (id, member) in self.connections.iter_mut() {
            if !member.needs_resync {
                continue;
            }
            if member.outbound.is_closed() {
                member.needs_resync = false;
                continue;
            }
            if member.outbound.capacity() == 0 {
                waiting = true;
                continue;
            }
            let frame = full
                .get_or_insert_with(|| Arc::new(encode_sync_frame(&self.doc.encode_full())))
                .clone();
            if member.outbound.offer(Outbound::Binary(frame)) {
                member.needs_resync = false;
                log::trace!("Room {} sent full state to {id}", self.room_id);
            } else {
                waiting = true;
            }
        }
        if waiting {
            self.schedule_resync();
        }
    }

    fn schedule_resync(&mut self) {
        if !self.resync_scheduled {
            self.resync_scheduled = true;
            self.schedule(RESYNC_RETRY, RoomCommand::ResyncCheck);
        }
    }

    fn fan_out(&self, frame: Outbound, except: Option<ConnectionId>) {
        for (id, member) in &self.connections {
            if Some(*id) == except {
                continue;
            }
            self.deliver(&member.outbound, frame.clone());
        }
    }

    fn deliver(&self, outbound: &OutboundSender, frame: Outbound) {
        if !outbound.offer(frame) {
            self.shared.stats.record_dropped_frame();
            log::debug!("Room {} dropped a frame for a slow connection", self.room_id);
        }
    }

    fn send_error(&self, to: ConnectionId, code: ErrorCode, message: String) {
        if let Some(member) = self.connections.get(&to) {
            let envelope = ControlEnvelope::new(ControlMessage::error(code, message))
                .with_room(&self.room_id);
            self.deliver(&member.outbound, Outbound::Control(envelope));
        }
    }

    // ─── Shutdown ─────────────────────────────────────────────────────

    async fn finish(mut self) {
        if self.version > 0 || !self.doc.is_empty() {
            self.queue_persist(true);
        }
        let RoomActor {
            persist_tx,
            persist_worker,
            room_id,
            ..
        } = self;
        drop(persist_tx);
        if let Some(worker) = persist_worker {
            if let Err(e) = worker.await {
                log::error!("Room {room_id} persistence worker failed: {e}");
            }
        }
        log::info!("Room {room_id} closed");
    }
}

/// Writes the most recent snapshot, skipping superseded ones.
///
/// Exits once the room drops its sender, after writing the final value.
async fn persist_loop(
    store: Arc<dyn SnapshotStore>,
    mut rx: watch::Receiver<Option<PersistedSnapshot>>,
    shared: Arc<RegistryShared>,
    room_id: String,
) {
    while rx.changed().await.is_ok() {
        let Some(snapshot) = rx.borrow_and_update().clone() else {
            continue;
        };
        let version = snapshot.version;
        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.upsert(&snapshot)).await {
            Ok(Ok(())) => {
                shared.stats.record_persisted();
                log::trace!("Room {room_id} persisted v{version}");
            }
            Ok(Err(e)) => {
                shared.stats.record_persist_failure();
                log::error!("Room {room_id} failed to persist v{version}: {e}");
            }
            Err(e) => {
                shared.stats.record_persist_failure();
                log::error!("Room {room_id} persistence task failed: {e}");
            }
        }
    }
}
