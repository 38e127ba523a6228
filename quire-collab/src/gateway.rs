//! WebSocket gateway: authentication, framing, and dispatch to rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Room p/f (actor) ── SnapshotStore
//!             ├── SyncServer ── RoomRegistry
//! Client B ──┘      │                  └── Room p/g (actor) ── SnapshotStore
//!                   │
//!       upgrade: session token ──► SessionValidator ──► AuthenticatedUser
//! ```
//!
//! Per socket:
//! 1. Read the session token (`Authorization: Bearer` or `Cookie: session=`)
//!    and the `projectId`/`fileId` query during the upgrade.
//! 2. Validate it. Failure closes the socket with 1008.
//! 3. Send `authenticated`, then pump socket input to the registry and the
//!    session's outbound queue to the socket until either side closes.
//!
//! Messages larger than `max_frame_size` are refused by the WebSocket layer
//! before they are buffered; the socket is closed with 1009.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthError, SessionValidator};
use crate::document::CONTENT_FIELD;
use crate::error::CollabError;
use crate::protocol::{ControlEnvelope, ControlMessage, ErrorCode, Frame, ProtocolError};
use crate::registry::{RegistryStats, RoomRegistry};
use crate::room::{RoomConfig, RoomJoinError, RoomKey};
use crate::session::{ConnectionSession, Outbound, OutboundSender};
use crate::storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig};

/// WebSocket close code for policy violations.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames queued per connection before new ones are dropped
    pub outbound_capacity: usize,
    /// Grace period before an empty room is evicted
    pub room_idle_timeout: Duration,
    /// Minimum gap between forwarded cursor moves per connection
    pub cursor_throttle: Duration,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Name of the persisted document within each room
    pub doc_name: String,
    /// Largest accepted inbound message in bytes
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            room_idle_timeout: Duration::from_secs(30),
            cursor_throttle: Duration::from_millis(100),
            storage_path: None,
            doc_name: CONTENT_FIELD.to_string(),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// WebSocket limits for accepted sockets.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_size))
            .max_frame_size(Some(self.max_frame_size))
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            idle_timeout: self.room_idle_timeout,
            cursor_throttle: self.cursor_throttle,
            doc_name: self.doc_name.clone(),
            ..RoomConfig::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub rooms: RegistryStats,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    messages_received: AtomicU64,
    malformed_messages: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: RoomRegistry,
    validator: Arc<dyn SessionValidator>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if `storage_path` is set.
    pub fn new(config: ServerConfig, validator: Arc<dyn SessionValidator>) -> Result<Self, CollabError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksSnapshotStore::open(StoreConfig::at(path.clone()))?),
            None => Arc::new(MemorySnapshotStore::new()),
        };
        Ok(Self::with_store(config, validator, store))
    }

    pub fn with_store(
        config: ServerConfig,
        validator: Arc<dyn SessionValidator>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let registry = RoomRegistry::new(store, config.room_config());
        Self {
            config,
            registry,
            validator,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                registry: self.registry.clone(),
                validator: self.validator.clone(),
                config: self.config.clone(),
                stats: self.stats.clone(),
                addr,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.handle(stream).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.stats.malformed_messages.load(Ordering::Relaxed),
            rooms: self.registry.stats(),
        }
    }

    /// Close all rooms, flushing their final snapshots.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

// ───────────────────────────────────────────────────────────────────
// Upgrade request
// ───────────────────────────────────────────────────────────────────

/// What the gateway reads from the HTTP upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub token: Option<String>,
    pub project_id: Option<String>,
    pub file_id: Option<String>,
}

impl UpgradeRequest {
    pub fn from_request(req: &Request) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let token = header("authorization")
            .as_deref()
            .and_then(bearer_token)
            .or_else(|| header("cookie").as_deref().and_then(session_cookie));

        let mut upgrade = Self {
            token,
            ..Self::default()
        };
        for (key, value) in parse_query(req.uri().query().unwrap_or("")) {
            match key {
                "projectId" => upgrade.project_id = Some(value.to_string()),
                "fileId" => upgrade.file_id = Some(value.to_string()),
                _ => {}
            }
        }
        upgrade
    }
}

fn bearer_token(value: &str) -> Option<String> {
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn session_cookie(value: &str) -> Option<String> {
    value
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "session")
        .map(|(_, token)| token.to_string())
        .filter(|t| !t.is_empty())
}

fn parse_query(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

// ───────────────────────────────────────────────────────────────────
// Connection
// ───────────────────────────────────────────────────────────────────

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

struct Connection {
    registry: RoomRegistry,
    validator: Arc<dyn SessionValidator>,
    config: ServerConfig,
    stats: Arc<AtomicServerStats>,
    addr: SocketAddr,
}

impl Connection {
    async fn handle(self, stream: TcpStream) -> Result<(), CollabError> {
        let mut upgrade = UpgradeRequest::default();
        let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            |req: &Request, resp: Response| {
                upgrade = UpgradeRequest::from_request(req);
                Ok(resp)
            },
            Some(self.config.websocket_config()),
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let user = match self.authenticate(upgrade.token.as_deref()).await {
            Ok(user) => user,
            Err(e) => {
                self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected connection from {}: {e}", self.addr);
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: e.to_string().into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
        };

        let (outbound, mut outbound_rx) = OutboundSender::channel(self.config.outbound_capacity);
        let mut session = ConnectionSession::new(user, outbound);
        let mut pending_room = match (upgrade.project_id, upgrade.file_id) {
            (Some(p), Some(f)) => Some((p, f)),
            _ => None,
        };
        log::info!(
            "{} authenticated as {} ({})",
            self.addr,
            session.user().display_name,
            session.id()
        );

        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let result = async {
            let hello = ControlEnvelope::new(ControlMessage::Authenticated {
                user: session.user().clone(),
            })
            .with_client(session.id());
            send_control(&mut ws_sender, &hello).await?;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let reply = match msg {
                            Some(Ok(Message::Binary(data))) => {
                                self.on_binary(&session, &data).await
                            }
                            Some(Ok(Message::Text(text))) => {
                                self.on_text(&mut session, &mut pending_room, text.as_str()).await
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {}", self.addr);
                                break;
                            }
                            Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size }))) => {
                                let e = ProtocolError::FrameTooLarge { size, limit: max_size };
                                self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Closing {}: {e}", self.addr);
                                let frame = CloseFrame { code: CloseCode::Size, reason: e.to_string().into() };
                                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {}: {e}", self.addr);
                                break;
                            }
                            Some(Ok(_)) => None,
                        };
                        if let Some(reply) = reply {
                            send_control(&mut ws_sender, &reply).await?;
                        }
                    }

                    out = outbound_rx.recv() => {
                        match out {
                            Some(Outbound::Binary(frame)) => {
                                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                            }
                            Some(Outbound::Control(envelope)) => {
                                send_control(&mut ws_sender, &envelope).await?;
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), CollabError>(())
        }
        .await;

        self.registry.leave_room(&mut session).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn authenticate(&self, token: Option<&str>) -> Result<crate::auth::AuthenticatedUser, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        self.validator.validate(token).await
    }

    async fn on_binary(&self, session: &ConnectionSession, data: &[u8]) -> Option<ControlEnvelope> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let submitted = match Frame::decode(data) {
            Ok(Frame::Sync(delta)) => session.submit_update(delta).await,
            Ok(Frame::Awareness(payload)) => session.submit_awareness(payload).await,
            Err(e) => {
                log::warn!("Dropping bad frame from {}: {e}", self.addr);
                return Some(self.malformed(e.to_string()));
            }
        };
        (!submitted).then(not_in_room)
    }

    async fn on_text(
        &self,
        session: &mut ConnectionSession,
        pending_room: &mut Option<(String, String)>,
        text: &str,
    ) -> Option<ControlEnvelope> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let envelope = match ControlEnvelope::from_json(text) {
            Ok(env) => env,
            Err(e) => {
                log::warn!("Dropping bad envelope from {}: {e}", self.addr);
                return Some(self.malformed(e.to_string()));
            }
        };

        match envelope.message {
            ControlMessage::JoinRoom { project_id, file_id } => {
                let key = match (project_id, file_id, envelope.room_id.as_deref()) {
                    (Some(p), Some(f), _) => RoomKey::new(p, f),
                    (None, None, Some(room_id)) => RoomKey::parse(room_id),
                    (p, f, _) => match pending_room.clone() {
                        Some((pp, pf)) => RoomKey::new(p.unwrap_or(pp), f.unwrap_or(pf)),
                        None => Err(RoomJoinError::MissingRoom),
                    },
                };
                let key = match key {
                    Ok(key) => key,
                    Err(e) => {
                        return Some(ControlEnvelope::new(ControlMessage::error(
                            ErrorCode::InvalidRoom,
                            e.to_string(),
                        )))
                    }
                };
                match self.registry.join_room(session, key).await {
                    Ok(_) => {
                        *pending_room = None;
                        None
                    }
                    Err(e) => {
                        let code = match &e {
                            CollabError::RoomJoin(RoomJoinError::Unavailable(_)) => ErrorCode::Internal,
                            _ => ErrorCode::InvalidRoom,
                        };
                        Some(ControlEnvelope::new(ControlMessage::error(code, e.to_string())))
                    }
                }
            }
            ControlMessage::LeaveRoom => {
                self.registry.leave_room(session).await;
                None
            }
            ControlMessage::CursorMove { cursor } => {
                (!session.submit_cursor(cursor).await).then(not_in_room)
            }
            ControlMessage::DocumentUpdate { update } => {
                (!session.submit_update(update).await).then(not_in_room)
            }
            ControlMessage::SyncRequest { state_vector } => {
                (!session.request_sync(state_vector.unwrap_or_default()).await).then(not_in_room)
            }
            other @ (ControlMessage::SyncResponse { .. }
            | ControlMessage::RoomJoined { .. }
            | ControlMessage::Authenticated { .. }
            | ControlMessage::Error { .. }) => {
                Some(self.malformed(format!("'{}' is not accepted from clients", other.kind())))
            }
        }
    }

    fn malformed(&self, message: String) -> ControlEnvelope {
        self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
        ControlEnvelope::new(ControlMessage::error(ErrorCode::MalformedMessage, message))
    }
}

fn not_in_room() -> ControlEnvelope {
    ControlEnvelope::new(ControlMessage::error(ErrorCode::NotInRoom, "join a room first"))
}

async fn send_control(sink: &mut WsSink, envelope: &ControlEnvelope) -> Result<(), CollabError> {
    sink.send(Message::Text(envelope.to_json()?.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticSessionValidator;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.doc_name, "content");
        assert!(config.storage_path.is_none());
        assert_eq!(config.room_config().cursor_throttle, config.cursor_throttle);

        let ws = config.websocket_config();
        assert_eq!(ws.max_message_size, Some(config.max_frame_size));
        assert_eq!(ws.max_frame_size, Some(config.max_frame_size));
    }

    #[test]
    fn test_upgrade_reads_bearer_and_query() {
        let req = request(
            "ws://localhost/collab?projectId=p1&fileId=f1&x=",
            &[("Authorization", "Bearer tok-123")],
        );
        let upgrade = UpgradeRequest::from_request(&req);
        assert_eq!(upgrade.token.as_deref(), Some("tok-123"));
        assert_eq!(upgrade.project_id.as_deref(), Some("p1"));
        assert_eq!(upgrade.file_id.as_deref(), Some("f1"));
    }

    #[test]
    fn test_upgrade_reads_session_cookie() {
        let req = request("ws://localhost/", &[("Cookie", "theme=dark; session=abc; other=1")]);
        assert_eq!(UpgradeRequest::from_request(&req).token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_upgrade_without_token() {
        let req = request("ws://localhost/", &[("Authorization", "Basic Zm9vOmJhcg==")]);
        let upgrade = UpgradeRequest::from_request(&req);
        assert!(upgrade.token.is_none());
        assert!(upgrade.project_id.is_none());
    }

    #[tokio::test]
    async fn test_server_in_memory() {
        let server = SyncServer::new(
            ServerConfig::default(),
            Arc::new(StaticSessionValidator::new()),
        )
        .unwrap();
        assert_eq!(server.stats(), ServerStats::default());
        assert_eq!(server.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, Arc::new(StaticSessionValidator::new()));
        assert!(server.is_ok());
        assert!(dir.path().join("db").exists());
    }
}
