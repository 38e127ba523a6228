//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Local edits forwarded as binary sync frames, remote frames merged
//! - Cursor and presence updates
//! - Offline editing with reconciliation on reconnect
//!
//! ```text
//!  editor / insert / delete
//!          │ Origin::Local
//!          ▼
//!  ReplicatedDocument ── forwarder task ──► writer task ──► socket
//!          ▲                    │ offline
//!          │ Origin::Remote     ▼
//!    reader task ◄── socket   OfflineManager (JSON cache)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::auth::{AuthError, AuthenticatedUser};
use crate::awareness::{AwarenessEntry, AwarenessPayload, CursorPosition};
use crate::document::{DocumentUpdate, Origin, ReplicatedDocument};
use crate::error::CollabError;
use crate::offline::{OfflineCache, OfflineManager, PendingOperation, ReconcileOutcome, SyncStrategy};
use crate::protocol::{
    encode_awareness_frame, encode_sync_frame, ControlEnvelope, ControlMessage, ErrorCode, Frame,
    ProtocolError,
};
use crate::room::RoomJoinError;
use crate::session::ConnectionId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTGOING_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined the room and received its state
    Connected { client_id: ConnectionId, connections: usize },
    /// Connection lost; edits are now queued offline
    Disconnected,
    /// A remote delta changed the document
    RemoteUpdate,
    /// Full presence set of the room
    Presence(AwarenessPayload),
    /// Another connection moved its cursor
    CursorMoved {
        client_id: Option<String>,
        cursor: Option<CursorPosition>,
    },
    /// Offline edits were reconciled against the server state
    Reconciled(ReconcileOutcome),
    /// The server rejected something we sent
    ServerError { code: ErrorCode, message: String },
}

/// Exponential reconnect delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
    /// Give up after this many attempts (None = retry forever)
    pub max_attempts: Option<u32>,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2,
            max: Duration::from_secs(30),
            max_attempts: None,
            attempt: 0,
        }
    }
}

impl Backoff {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        let delay = self
            .initial
            .saturating_mul(self.factor.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Session token sent as `Authorization: Bearer`
    pub token: String,
    pub project_id: String,
    pub file_id: String,
    /// Resolution used when offline edits meet a changed server document
    pub strategy: SyncStrategy,
    /// Directory for the offline cache
    pub cache_dir: PathBuf,
    pub backoff: Backoff,
    /// Limit for each step of the connect handshake
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        token: impl Into<String>,
        project_id: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            project_id: project_id.into(),
            file_id: file_id.into(),
            strategy: SyncStrategy::default(),
            cache_dir: PathBuf::from("quire_offline"),
            backoff: Backoff::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Connection URL with the room context in the query.
    pub fn url(&self) -> String {
        format!(
            "{}/?projectId={}&fileId={}",
            self.server_url.trim_end_matches('/'),
            self.project_id,
            self.file_id
        )
    }
}

/// Identity assigned by the server after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: ConnectionId,
    pub user: AuthenticatedUser,
}

/// State shared between the client and its background tasks.
struct ClientShared {
    project_id: String,
    file_id: String,
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    offline: Mutex<OfflineManager>,
    identity: RwLock<Option<ClientIdentity>>,
    events: mpsc::Sender<SyncEvent>,
}

impl ClientShared {
    fn emit(&self, event: SyncEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("Sync event dropped, receiver full or gone");
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn send(&self, msg: Message) -> bool {
        let outgoing = self.outgoing.lock().await;
        match outgoing.as_ref() {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        }
    }

    /// Send a local edit, or queue it offline when there is no connection.
    async fn dispatch_local(&self, doc: &ReplicatedDocument, update: DocumentUpdate) {
        if *self.state.read().await == ConnectionState::Connected
            && self.send(Message::Binary(encode_sync_frame(&update.delta).into())).await
        {
            return;
        }

        let user_id = self
            .identity
            .read()
            .await
            .as_ref()
            .map(|i| i.user.user_id.clone())
            .unwrap_or_default();
        let op = match &update.edit {
            Some(edit) => PendingOperation::from_edit(edit, user_id),
            None => PendingOperation::retain(0, doc.len(), user_id),
        };
        let content = doc.content();

        let mut offline = self.offline.lock().await;
        if !offline.is_offline(&self.project_id, &self.file_id) {
            if let Err(e) = offline.begin_offline(&self.project_id, &self.file_id, &content).await {
                log::error!("Failed to enter offline mode: {e}");
                return;
            }
        }
        if let Err(e) = offline
            .record_change(&self.project_id, &self.file_id, op, update.delta.to_vec(), &content)
            .await
        {
            log::error!("Failed to queue offline edit: {e}");
        }
    }

    fn merge_remote(&self, doc: &ReplicatedDocument, delta: &[u8]) {
        match doc.apply_delta(delta, server_origin()) {
            Ok(outcome) if outcome.changed => self.emit(SyncEvent::RemoteUpdate),
            Ok(_) => {}
            Err(e) => log::warn!("Dropping remote delta: {e}"),
        }
    }

    fn on_frame(&self, doc: &ReplicatedDocument, data: &[u8]) {
        match Frame::decode(data) {
            Ok(Frame::Sync(delta)) => self.merge_remote(doc, &delta),
            Ok(Frame::Awareness(payload)) => match AwarenessPayload::decode(&payload) {
                Ok(presence) => self.emit(SyncEvent::Presence(presence)),
                Err(e) => log::warn!("Dropping presence frame: {e}"),
            },
            Err(e) => log::warn!("Dropping bad frame: {e}"),
        }
    }

    fn on_control(&self, doc: &ReplicatedDocument, envelope: ControlEnvelope) {
        match envelope.message {
            ControlMessage::CursorMove { cursor } => self.emit(SyncEvent::CursorMoved {
                client_id: envelope.client_id,
                cursor,
            }),
            ControlMessage::SyncResponse { update, .. } => self.merge_remote(doc, &update),
            ControlMessage::Error { code, message } => {
                log::warn!("Server error {code:?}: {message}");
                self.emit(SyncEvent::ServerError { code, message });
            }
            ControlMessage::RoomJoined { connections, .. } => {
                log::debug!("Room now has {connections} connections");
            }
            other => log::trace!("Ignoring '{}' from server", other.kind()),
        }
    }

    async fn on_disconnect(&self, doc: &ReplicatedDocument) {
        self.outgoing.lock().await.take();
        let previous = std::mem::replace(&mut *self.state.write().await, ConnectionState::Disconnected);
        if previous != ConnectionState::Connected {
            return;
        }

        log::info!("Connection lost, editing {}/{} offline", self.project_id, self.file_id);
        let content = doc.content();
        let result = self
            .offline
            .lock()
            .await
            .begin_offline(&self.project_id, &self.file_id, &content)
            .await;
        if let Err(e) = result {
            log::error!("Failed to enter offline mode: {e}");
        }
        self.emit(SyncEvent::Disconnected);
    }
}

/// Origin tag for deltas received from the server.
fn server_origin() -> Origin {
    Origin::Remote {
        from: ConnectionId::from(Uuid::nil()),
    }
}

/// The sync client.
///
/// Owns the local replica of one document and keeps it in sync with a room
/// on the server. Must be created inside a Tokio runtime.
pub struct SyncClient {
    config: ClientConfig,
    doc: Arc<ReplicatedDocument>,
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    backoff: Backoff,
    forwarder: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let offline = OfflineManager::new(OfflineCache::new(config.cache_dir.clone()), config.strategy);
        let shared = Arc::new(ClientShared {
            project_id: config.project_id.clone(),
            file_id: config.file_id.clone(),
            state: RwLock::new(ConnectionState::Disconnected),
            outgoing: Mutex::new(None),
            offline: Mutex::new(offline),
            identity: RwLock::new(None),
            events: event_tx,
        });

        let doc = Arc::new(ReplicatedDocument::new());
        let local_edits = doc.subscribe();
        let forwarder = tokio::spawn(forward_local_edits(doc.clone(), shared.clone(), local_edits));

        Self {
            backoff: config.backoff.clone(),
            config,
            doc,
            shared,
            event_rx: Some(event_rx),
            forwarder,
            reader: None,
            writer: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// The local replica. Edits made on it directly are forwarded too.
    pub fn document(&self) -> Arc<ReplicatedDocument> {
        self.doc.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn content(&self) -> String {
        self.doc.content()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn identity(&self) -> Option<ClientIdentity> {
        self.shared.identity.read().await.clone()
    }

    pub async fn is_offline(&self) -> bool {
        self.shared
            .offline
            .lock()
            .await
            .is_offline(&self.config.project_id, &self.config.file_id)
    }

    /// Number of edits queued while offline.
    pub async fn pending_operations(&self) -> usize {
        self.shared
            .offline
            .lock()
            .await
            .state(&self.config.project_id, &self.config.file_id)
            .map_or(0, |s| s.pending_operations.len())
    }

    /// Proposed text of an `ask-user` reconciliation awaiting confirmation.
    pub async fn proposed_resolution(&self) -> Option<String> {
        self.shared
            .offline
            .lock()
            .await
            .awaiting_confirmation(&self.config.project_id, &self.config.file_id)
            .map(str::to_string)
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Connect, authenticate, join the room and reconcile offline edits.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        self.stop_tasks();
        self.shared.set_state(ConnectionState::Connecting).await;
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stop_tasks();
                self.shared.outgoing.lock().await.take();
                self.shared.set_state(ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), CollabError> {
        let timeout = self.config.handshake_timeout;
        let mut request = self.config.url().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|_| AuthError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| CollabError::NetworkDrop("connect timed out".to_string()))??;
        let (mut sink, mut stream) = ws_stream.split();

        let identity = match next_incoming(&mut stream, timeout).await? {
            Incoming::Control(ControlEnvelope {
                message: ControlMessage::Authenticated { user },
                client_id,
                ..
            }) => {
                let client_id = client_id
                    .as_deref()
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .map(ConnectionId::from)
                    .ok_or_else(|| ProtocolError::Unexpected("authenticated without a client id".into()))?;
                ClientIdentity { client_id, user }
            }
            other => {
                return Err(ProtocolError::Unexpected(format!("expected authenticated, got {other:?}")).into())
            }
        };

        let join = ControlEnvelope::new(ControlMessage::JoinRoom {
            project_id: Some(self.config.project_id.clone()),
            file_id: Some(self.config.file_id.clone()),
        });
        sink.send(Message::Text(join.to_json()?.into())).await?;

        // room_joined is followed by the full document state.
        let mut connections = None;
        let mut initial = None;
        while initial.is_none() {
            match next_incoming(&mut stream, timeout).await? {
                Incoming::Control(envelope) => match envelope.message {
                    ControlMessage::RoomJoined { connections: n, .. } => connections = Some(n),
                    ControlMessage::Error { message, .. } => {
                        return Err(RoomJoinError::Unavailable(message).into());
                    }
                    _ => {}
                },
                Incoming::Frame(Frame::Sync(update)) if connections.is_some() => initial = Some(update),
                Incoming::Frame(Frame::Awareness(payload)) => {
                    if let Ok(presence) = AwarenessPayload::decode(&payload) {
                        self.shared.emit(SyncEvent::Presence(presence));
                    }
                }
                Incoming::Frame(Frame::Sync(_)) => {}
            }
        }
        let initial = initial.unwrap_or_default();

        let remote = ReplicatedDocument::from_update(&initial, Origin::InitialSync)?;
        self.doc.apply_delta(&initial, server_origin())?;

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        *self.shared.outgoing.lock().await = Some(out_tx);
        *self.shared.identity.write().await = Some(identity.clone());
        self.shared.set_state(ConnectionState::Connected).await;
        self.writer = Some(tokio::spawn(write_loop(sink, out_rx)));

        // Remote deltas must merge after the reconciled text replaces ours.
        self.reconcile_offline(&remote).await?;
        self.reader = Some(tokio::spawn(read_loop(stream, self.doc.clone(), self.shared.clone())));

        let connections = connections.unwrap_or(1);
        log::info!(
            "Connected to {}/{} as {} ({connections} in room)",
            self.config.project_id,
            self.config.file_id,
            identity.client_id
        );
        self.shared.emit(SyncEvent::Connected {
            client_id: identity.client_id,
            connections,
        });
        Ok(())
    }

    async fn reconcile_offline(&self, remote: &ReplicatedDocument) -> Result<(), CollabError> {
        let (project_id, file_id) = (&self.config.project_id, &self.config.file_id);
        let mut offline = self.shared.offline.lock().await;
        let has_pending = match offline.restore(project_id, file_id).await? {
            Some(state) => state.has_pending(),
            None => return Ok(()),
        };
        if !has_pending {
            // The CRDT merge above already integrated everything.
            offline.discard(project_id, file_id).await?;
            return Ok(());
        }
        let reconciliation = offline.reconcile(project_id, file_id, &remote.content()).await?;
        drop(offline);

        let target = match &reconciliation.outcome {
            ReconcileOutcome::Unchanged => Some(remote.content()),
            ReconcileOutcome::Resolved { content, .. } => Some(content.clone()),
            ReconcileOutcome::NeedsConfirmation { .. } => None,
        };
        if let Some(target) = target {
            if self.doc.content() != target {
                self.doc.replace_content(&target);
            }
            self.push_missing(&remote.current_vector()).await?;
        }
        self.shared.emit(SyncEvent::Reconciled(reconciliation.outcome));
        Ok(())
    }

    /// Accept the text for an `ask-user` reconciliation and publish it.
    pub async fn confirm_reconciliation(&self, accepted: &str) -> Result<(), CollabError> {
        self.shared
            .offline
            .lock()
            .await
            .complete_reconciliation(&self.config.project_id, &self.config.file_id, accepted)
            .await?;
        if self.doc.content() != accepted {
            self.doc.replace_content(accepted);
        }
        self.push_missing(&[]).await
    }

    /// Send everything the server lacks relative to `remote_vector`.
    async fn push_missing(&self, remote_vector: &[u8]) -> Result<(), CollabError> {
        let diff = self.doc.encode_delta(remote_vector)?;
        if !self.shared.send(Message::Binary(encode_sync_frame(&diff).into())).await {
            return Err(CollabError::NetworkDrop("connection closed while publishing".to_string()));
        }
        Ok(())
    }

    /// Reconnect with exponential backoff.
    ///
    /// Authentication failures are not retried.
    pub async fn reconnect(&mut self) -> Result<(), CollabError> {
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                return Err(CollabError::NetworkDrop(format!(
                    "gave up after {} reconnect attempts",
                    self.backoff.attempts()
                )));
            };
            self.shared.set_state(ConnectionState::Reconnecting).await;
            log::info!("Reconnecting in {delay:?} (attempt {})", self.backoff.attempts());
            tokio::time::sleep(delay).await;

            match self.connect().await {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(e @ CollabError::Authentication(_)) => return Err(e),
                Err(e) => log::warn!("Reconnect attempt failed: {e}"),
            }
        }
    }

    /// Close the connection. Later edits are queued offline.
    pub async fn disconnect(&mut self) {
        self.shared.set_state(ConnectionState::Disconnected).await;
        // Dropping the sender lets the writer close the socket.
        self.shared.outgoing.lock().await.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn stop_tasks(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }

    // ─── Editing ──────────────────────────────────────────────────────

    pub fn insert(&self, position: usize, text: &str) -> Result<(), CollabError> {
        self.doc.insert(position, text)?;
        Ok(())
    }

    pub fn delete(&self, position: usize, length: usize) -> Result<(), CollabError> {
        self.doc.delete(position, length)?;
        Ok(())
    }

    /// Send a cursor move. Dropped while offline.
    pub async fn send_cursor(&self, cursor: Option<CursorPosition>) -> Result<(), CollabError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let envelope = ControlEnvelope::new(ControlMessage::CursorMove { cursor });
        self.shared.send(Message::Text(envelope.to_json()?.into())).await;
        Ok(())
    }

    /// Publish our presence entry as an awareness frame. Dropped while offline.
    pub async fn send_awareness(&self, cursor: Option<CursorPosition>) -> Result<(), CollabError> {
        let Some(identity) = self.identity().await else {
            return Ok(());
        };
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let mut entry = AwarenessEntry::new(identity.client_id, &identity.user);
        entry.cursor = cursor;
        let payload = AwarenessPayload { entries: vec![entry] }.encode()?;
        self.shared
            .send(Message::Binary(encode_awareness_frame(&payload).into()))
            .await;
        Ok(())
    }

    /// Ask the server for anything this replica is missing.
    pub async fn request_sync(&self) -> Result<(), CollabError> {
        let envelope = ControlEnvelope::new(ControlMessage::SyncRequest {
            state_vector: Some(self.doc.current_vector()),
        });
        if !self.shared.send(Message::Text(envelope.to_json()?.into())).await {
            return Err(CollabError::NetworkDrop("not connected".to_string()));
        }
        Ok(())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.forwarder.abort();
        self.stop_tasks();
    }
}

// ───────────────────────────────────────────────────────────────────
// Background tasks
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Incoming {
    Control(ControlEnvelope),
    Frame(Frame),
}

async fn next_incoming(stream: &mut SplitStream<WsStream>, timeout: Duration) -> Result<Incoming, CollabError> {
    loop {
        let msg = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| CollabError::NetworkDrop("timed out waiting for server".to_string()))?;
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Ok(Incoming::Control(ControlEnvelope::from_json(text.as_str())?));
            }
            Some(Ok(Message::Binary(data))) => return Ok(Incoming::Frame(Frame::decode(&data)?)),
            Some(Ok(Message::Close(frame))) => {
                return Err(match frame {
                    Some(f) if f.code == CloseCode::Policy => AuthError::InvalidToken.into(),
                    Some(f) => CollabError::NetworkDrop(format!("closed by server: {}", f.reason.as_str())),
                    None => CollabError::NetworkDrop("closed by server".to_string()),
                });
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(CollabError::NetworkDrop("connection closed".to_string())),
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, doc: Arc<ReplicatedDocument>, shared: Arc<ClientShared>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => shared.on_frame(&doc, &data),
            Ok(Message::Text(text)) => match ControlEnvelope::from_json(text.as_str()) {
                Ok(envelope) => shared.on_control(&doc, envelope),
                Err(e) => log::warn!("Ignoring bad control message: {e}"),
            },
            Ok(Message::Close(frame)) => {
                log::info!("Server closed the connection: {frame:?}");
                break;
            }
            Err(e) => {
                log::warn!("Connection error: {e}");
                break;
            }
            Ok(_) => {}
        }
    }
    shared.on_disconnect(&doc).await;
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            log::warn!("Send failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn forward_local_edits(
    doc: Arc<ReplicatedDocument>,
    shared: Arc<ClientShared>,
    mut events: broadcast::Receiver<DocumentUpdate>,
) {
    loop {
        match events.recv().await {
            Ok(update) if update.origin.is_local() && update.changed => {
                shared.dispatch_local(&doc, update).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Forwarder lagged {n} local edits, sending full state");
                let full = DocumentUpdate {
                    delta: Arc::new(doc.encode_full()),
                    origin: Origin::Local,
                    changed: true,
                    edit: None,
                };
                shared.dispatch_local(&doc, full).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> ClientConfig {
        let mut config = ClientConfig::new("ws://127.0.0.1:9", "token", "proj", "file");
        config.cache_dir = dir.path().to_path_buf();
        config.handshake_timeout = Duration::from_secs(2);
        config
    }

    async fn wait_for_pending(client: &SyncClient, expected: usize) {
        for _ in 0..100 {
            if client.pending_operations().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} pending operations, got {}", client.pending_operations().await);
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::default().with_max_attempts(8);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 8);
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[6], Duration::from_secs(30));
        assert_eq!(delays[7], Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_backoff_unbounded_by_default() {
        let mut backoff = Backoff::default();
        for _ in 0..100 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_config_url() {
        let config = ClientConfig::new("ws://localhost:9090/", "t", "p1", "f1");
        assert_eq!(config.url(), "ws://localhost:9090/?projectId=p1&fileId=f1");
        assert_eq!(config.strategy, SyncStrategy::MergeChanges);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = SyncClient::new(config(&dir));

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.identity().await.is_none());
        assert_eq!(client.pending_operations().await, 0);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_edits_queue_offline_when_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let client = SyncClient::new(config(&dir));

        client.insert(0, "hello").unwrap();
        client.insert(5, " world").unwrap();
        client.delete(0, 1).unwrap();
        wait_for_pending(&client, 3).await;

        assert!(client.is_offline().await);
        assert_eq!(client.content(), "ello world");
        assert!(dir.path().join("proj-file.json").exists());
    }

    #[tokio::test]
    async fn test_edits_through_document_are_queued() {
        let dir = tempfile::tempdir().unwrap();
        let client = SyncClient::new(config(&dir));

        client.document().insert(0, "from an editor").unwrap();
        wait_for_pending(&client, 1).await;
    }

    #[tokio::test]
    async fn test_send_cursor_offline_noop() {
        let dir = tempfile::tempdir().unwrap();
        let client = SyncClient::new(config(&dir));
        client.send_cursor(Some(CursorPosition::new(1, 1))).await.unwrap();
        client.send_awareness(None).await.unwrap();
        assert!(client.request_sync().await.unwrap_err().is_network());
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.server_url = format!("ws://127.0.0.1:{port}");
        let mut client = SyncClient::new(cfg);

        let err = client.connect().await.unwrap_err();
        assert!(err.is_network(), "unexpected error: {err}");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
