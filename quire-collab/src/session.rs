//! Per-socket connection state.
//!
//! A `ConnectionSession` is created by the gateway after authentication and
//! lives as long as the socket. It carries the identity, the bounded outbound
//! queue drained by the socket writer, and the room it is currently in.
//! Everything it submits to a room is tagged `Origin::Remote { from: id }`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::document::Origin;
use crate::protocol::ControlEnvelope;
use crate::room::{RoomHandle, RoomKey};

/// Identity of one socket. Also used as the awareness client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Something to be written to a socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-encoded binary frame, shared across the fan-out.
    Binary(Arc<Vec<u8>>),
    Control(ControlEnvelope),
}

/// Sending half of a connection's outbound queue, as seen by rooms.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Outbound>,
    dropped: Arc<AtomicU64>,
}

impl OutboundSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue without waiting. A full or closed queue drops the frame.
    ///
    /// Returns whether the frame was queued.
    pub fn offer(&self, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Free slots in the queue right now.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Frames dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Membership of a session in a room.
#[derive(Debug)]
pub struct JoinedRoom {
    pub key: RoomKey,
    pub handle: RoomHandle,
}

/// One authenticated socket.
#[derive(Debug)]
pub struct ConnectionSession {
    id: ConnectionId,
    user: AuthenticatedUser,
    outbound: OutboundSender,
    room: Option<JoinedRoom>,
}

impl ConnectionSession {
    pub fn new(user: AuthenticatedUser, outbound: OutboundSender) -> Self {
        Self {
            id: ConnectionId::new(),
            user,
            outbound,
            room: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &AuthenticatedUser {
        &self.user
    }

    pub fn outbound(&self) -> &OutboundSender {
        &self.outbound
    }

    /// Origin tag for everything this session submits.
    pub fn origin(&self) -> Origin {
        Origin::Remote { from: self.id }
    }

    pub fn room(&self) -> Option<&JoinedRoom> {
        self.room.as_ref()
    }

    pub fn room_key(&self) -> Option<&RoomKey> {
        self.room.as_ref().map(|r| &r.key)
    }

    pub(crate) fn attach(&mut self, joined: JoinedRoom) {
        self.room = Some(joined);
    }

    pub(crate) fn detach(&mut self) -> Option<JoinedRoom> {
        self.room.take()
    }

    // ─── Room traffic ─────────────────────────────────────────────────

    /// Submit a document delta to the current room.
    pub async fn submit_update(&self, delta: Vec<u8>) -> bool {
        match &self.room {
            Some(joined) => joined.handle.update(self.id, delta).await,
            None => false,
        }
    }

    /// Submit a client awareness payload to the current room.
    pub async fn submit_awareness(&self, payload: Vec<u8>) -> bool {
        match &self.room {
            Some(joined) => joined.handle.awareness(self.id, payload).await,
            None => false,
        }
    }

    pub async fn submit_cursor(&self, cursor: Option<crate::awareness::CursorPosition>) -> bool {
        match &self.room {
            Some(joined) => joined.handle.cursor_move(self.id, cursor).await,
            None => false,
        }
    }

    /// Ask the room for what this session is missing.
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> bool {
        match &self.room {
            Some(joined) => joined.handle.sync_request(self.id, state_vector).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_origin_is_remote_from_self() {
        let (tx, _rx) = OutboundSender::channel(4);
        let session = ConnectionSession::new(AuthenticatedUser::new("u", "U"), tx);
        assert_eq!(session.origin(), Origin::Remote { from: session.id() });
        assert_eq!(session.origin().connection(), Some(session.id()));
    }

    #[test]
    fn test_offer_drops_when_full() {
        let (tx, mut rx) = OutboundSender::channel(1);
        assert_eq!(tx.capacity(), 1);
        assert!(tx.offer(Outbound::Binary(Arc::new(vec![1]))));
        assert_eq!(tx.capacity(), 0);
        assert!(!tx.offer(Outbound::Binary(Arc::new(vec![2]))));
        assert_eq!(tx.dropped(), 1);

        match rx.try_recv().unwrap() {
            Outbound::Binary(bytes) => assert_eq!(*bytes, vec![1]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_offer_after_close() {
        let (tx, rx) = OutboundSender::channel(4);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.offer(Outbound::Binary(Arc::new(Vec::new()))));
        assert_eq!(tx.dropped(), 1);
    }

    #[tokio::test]
    async fn test_submit_without_room() {
        let (tx, _rx) = OutboundSender::channel(4);
        let session = ConnectionSession::new(AuthenticatedUser::new("u", "U"), tx);
        assert!(session.room().is_none());
        assert!(!session.submit_update(vec![0]).await);
        assert!(!session.request_sync(Vec::new()).await);
    }
}
