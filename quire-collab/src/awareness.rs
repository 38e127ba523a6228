//! Ephemeral presence for one room: cursors, names, colors.
//!
//! ## Semantics
//!
//! ```text
//! join / cursor / leave
//!       │
//!       ▼
//! AwarenessStore (client_id → AwarenessEntry)
//!       │  any change
//!       ▼
//! AwarenessPayload { entries: <entire current set> }   (bincode, frame class 1)
//! ```
//!
//! The full set is rebroadcast on every change; peers replace their view
//! wholesale. Entries are never persisted and disappear with their connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthenticatedUser;
use crate::protocol::now_millis;
use crate::session::ConnectionId;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Fixed cursor palette. Colors are picked by hashing the user id.
pub const CURSOR_PALETTE: &[&str] = &[
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#d19a66", "#56b6c2", "#e5c07b", "#be5046",
    "#7f848e", "#528bff", "#ff6ac1", "#2bbac5",
];

/// Deterministic color for a user: FNV-1a over the user id, mod palette size.
pub fn color_for_user(user_id: &str) -> &'static str {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in user_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    CURSOR_PALETTE[(hash % CURSOR_PALETTE.len() as u64) as usize]
}

/// Cursor location in editor coordinates. Opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
    /// `(line, column)` of the other end of a selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<(u32, u32)>,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column, selection_end: None }
    }

    pub fn with_selection(mut self, line: u32, column: u32) -> Self {
        self.selection_end = Some((line, column));
        self
    }
}

/// Presence of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ConnectionId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
}

impl AwarenessEntry {
    pub fn new(client_id: ConnectionId, user: &AuthenticatedUser) -> Self {
        Self {
            client_id,
            user_id: user.user_id.clone(),
            display_name: user.display_name.clone(),
            color: color_for_user(&user.user_id).to_string(),
            cursor: None,
            last_seen: now_millis(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire payload
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AwarenessError {
    #[error("awareness encode failed: {0}")]
    Encode(String),
    #[error("awareness decode failed: {0}")]
    Decode(String),
}

/// Body of a class-1 binary frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessPayload {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessPayload {
    pub fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AwarenessError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let (payload, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| AwarenessError::Decode(e.to_string()))?;
        Ok(payload)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, client_id: ConnectionId) -> Option<&AwarenessEntry> {
        self.entries.iter().find(|e| e.client_id == client_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Presence map of one room. Owned by the room actor.
#[derive(Debug, Default)]
pub struct AwarenessStore {
    entries: BTreeMap<ConnectionId, AwarenessEntry>,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with its authenticated identity.
    pub fn join(&mut self, client_id: ConnectionId, user: &AuthenticatedUser) {
        self.entries.insert(client_id, AwarenessEntry::new(client_id, user));
    }

    /// Move a connection's cursor. Returns `false` for unknown connections.
    pub fn update_cursor(&mut self, client_id: ConnectionId, cursor: Option<CursorPosition>) -> bool {
        match self.entries.get_mut(&client_id) {
            Some(entry) => {
                entry.cursor = cursor;
                entry.last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Merge a client-submitted entry.
    ///
    /// Only the cursor is taken from the client; identity fields keep the
    /// values established at join.
    pub fn apply_client_entry(&mut self, client_id: ConnectionId, submitted: &AwarenessEntry) -> bool {
        self.update_cursor(client_id, submitted.cursor)
    }

    /// Drop every entry owned by a connection.
    pub fn remove_connection(&mut self, client_id: ConnectionId) -> Option<AwarenessEntry> {
        self.entries.remove(&client_id)
    }

    pub fn get(&self, client_id: ConnectionId) -> Option<&AwarenessEntry> {
        self.entries.get(&client_id)
    }

    /// Snapshot of the entire current state.
    pub fn payload(&self) -> AwarenessPayload {
        AwarenessPayload {
            entries: self.entries.values().cloned().collect(),
        }
    }

    pub fn encode_state(&self) -> Result<Vec<u8>, AwarenessError> {
        self.payload().encode()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> AuthenticatedUser {
        AuthenticatedUser::new("user-alice", "Alice")
    }

    fn bob() -> AuthenticatedUser {
        AuthenticatedUser::new("user-bob", "Bob")
    }

    #[test]
    fn test_color_is_deterministic() {
        assert_eq!(color_for_user("user-alice"), color_for_user("user-alice"));
        assert!(CURSOR_PALETTE.contains(&color_for_user("")));
    }

    #[test]
    fn test_join_uses_authenticated_identity() {
        let mut store = AwarenessStore::new();
        let id = ConnectionId::new();
        store.join(id, &alice());

        let entry = store.get(id).unwrap();
        assert_eq!(entry.display_name, "Alice");
        assert_eq!(entry.color, color_for_user("user-alice"));
        assert!(entry.cursor.is_none());
    }

    #[test]
    fn test_client_entry_cannot_spoof_identity() {
        let mut store = AwarenessStore::new();
        let id = ConnectionId::new();
        store.join(id, &alice());

        let mut forged = AwarenessEntry::new(id, &bob());
        forged.cursor = Some(CursorPosition::new(3, 7));
        assert!(store.apply_client_entry(id, &forged));

        let entry = store.get(id).unwrap();
        assert_eq!(entry.user_id, "user-alice");
        assert_eq!(entry.cursor, Some(CursorPosition::new(3, 7)));
    }

    #[test]
    fn test_update_unknown_connection() {
        let mut store = AwarenessStore::new();
        assert!(!store.update_cursor(ConnectionId::new(), Some(CursorPosition::new(0, 0))));
    }

    #[test]
    fn test_remove_connection_removes_only_owner() {
        let mut store = AwarenessStore::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        store.join(a, &alice());
        store.join(b, &bob());

        assert!(store.remove_connection(a).is_some());
        let payload = store.payload();
        assert_eq!(payload.len(), 1);
        assert!(payload.get(b).is_some());
        assert!(payload.get(a).is_none());
    }

    #[test]
    fn test_payload_codec() {
        let mut store = AwarenessStore::new();
        let id = ConnectionId::new();
        store.join(id, &alice());
        store.update_cursor(id, Some(CursorPosition::new(1, 2).with_selection(1, 9)));

        let bytes = store.encode_state().unwrap();
        let decoded = AwarenessPayload::decode(&bytes).unwrap();
        assert_eq!(decoded, store.payload());
    }

    #[test]
    fn test_payload_decode_garbage() {
        assert!(AwarenessPayload::decode(&[0xFF, 0x00, 0x13]).is_err());
    }
}
