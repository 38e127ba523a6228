//! # quire-collab: Real-time collaborative document sync
//!
//! Lets many clients edit the same file concurrently over WebSockets, with
//! CRDT convergence, live presence, durable snapshots, and offline editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │  auth at upgrade
//! │ (per user)  │  binary + JSON     │ (gateway)    │
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                   ┌───────────────┐
//! │ Replicated  │                   │ RoomRegistry  │
//! │ Document    │                   │ (project,file)│
//! │ (local)     │                   └──────┬────────┘
//! └──────┬──────┘                          │ one actor per room
//!        │ offline                         ▼
//!        ▼                          ┌───────────────┐     ┌──────────────┐
//! ┌─────────────┐                   │ Room          │ ──► │ SnapshotStore│
//! │ OfflineCache│                   │ doc+awareness │     │ (RocksDB)    │
//! └─────────────┘                   └───────────────┘     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Yrs-backed replicated text with origin-tagged updates
//! - [`awareness`]: Ephemeral presence (cursors, names, colors)
//! - [`protocol`]: Binary frames and JSON control envelopes
//! - [`room`] / [`registry`]: Room actors and their lifecycle
//! - [`storage`]: Snapshot persistence (RocksDB, in-memory)
//! - [`gateway`]: WebSocket server
//! - [`client`]: WebSocket client with offline reconciliation
//! - [`offline`]: Offline cache and merge strategies
//! - [`binding`]: Editor widget bridge

pub mod auth;
pub mod awareness;
pub mod binding;
pub mod client;
pub mod document;
pub mod error;
pub mod gateway;
pub mod offline;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, AuthenticatedUser, SessionValidator, StaticSessionValidator};
pub use awareness::{AwarenessEntry, AwarenessPayload, AwarenessStore, CursorPosition};
pub use binding::{Decoration, EditorBinding, EditorHandle};
pub use client::{Backoff, ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use document::{DocumentError, DocumentUpdate, Origin, ReplicatedDocument, TextEdit};
pub use error::CollabError;
pub use gateway::{ServerConfig, ServerStats, SyncServer};
pub use offline::{
    OfflineCache, OfflineDocumentState, OfflineError, OfflineManager, PendingOperation,
    ReconcileOutcome, SyncStrategy,
};
pub use protocol::{ControlEnvelope, ControlMessage, ErrorCode, Frame, ProtocolError};
pub use registry::{RegistryStats, RoomRegistry};
pub use room::{RoomConfig, RoomJoinError, RoomKey};
pub use session::{ConnectionId, ConnectionSession};
pub use storage::{
    MemorySnapshotStore, PersistedSnapshot, RocksSnapshotStore, SnapshotStore, StoreConfig,
    StoreError,
};
