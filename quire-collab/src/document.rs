//! Replicated text document backed by a Yrs CRDT.
//!
//! A `ReplicatedDocument` owns one `yrs::Doc` with a single shared text
//! named [`CONTENT_FIELD`]. Every mutation, local or merged, flows through
//! one of two entry points:
//!
//! ```text
//! insert / delete / replace_content ──┐
//!                                     ├── Yrs transaction ── DocumentUpdate event
//! apply_delta(bytes, Origin) ─────────┘                            │
//!                                                                  ▼
//!                                                 broadcast::Receiver subscribers
//! ```
//!
//! Merges are commutative and idempotent: replaying a delta that was already
//! integrated is accepted and reported with `changed == false`.
//!
//! Positions are UTF-8 byte offsets into the current content and must land on
//! a character boundary.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::session::ConnectionId;

/// Name of the shared text inside every document.
pub const CONTENT_FIELD: &str = "content";

/// Buffered document events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Where a delta came from.
///
/// Carried with every merge so that fan-out can skip the originating
/// connection and clients only retransmit their own edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by an edit on this replica.
    Local,
    /// Received from a peer connection.
    Remote { from: ConnectionId },
    /// Replayed from durable storage when a room is created.
    InitialSync,
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }

    /// The connection this delta arrived on, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Origin::Remote { from } => Some(*from),
            _ => None,
        }
    }
}

/// Emitted after every accepted mutation.
#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    /// Encoded Yrs update (v1) describing the mutation.
    pub delta: Arc<Vec<u8>>,
    pub origin: Origin,
    /// `false` when the delta was already integrated (duplicate delivery).
    pub changed: bool,
    /// The edit that produced a local update. `None` for merges.
    pub edit: Option<TextEdit>,
}

/// A local text edit in byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Replace { content: String },
}

/// Result of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub changed: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Bytes are not a valid Yrs update or state vector.
    #[error("malformed delta: {0}")]
    Decode(String),
    /// A well-formed update that could not be integrated.
    #[error("merge rejected: {0}")]
    Merge(String),
    #[error("position {position} is out of bounds (length {len})")]
    OutOfBounds { position: usize, len: usize },
    #[error("position {0} is not on a character boundary")]
    NotCharBoundary(usize),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// CRDT-backed shared text buffer.
pub struct ReplicatedDocument {
    doc: Doc,
    text: TextRef,
    events: broadcast::Sender<DocumentUpdate>,
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT_FIELD);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { doc, text, events }
    }

    /// Build a replica from a full-state update.
    pub fn from_update(update: &[u8], origin: Origin) -> Result<Self, DocumentError> {
        let doc = Self::new();
        if !update.is_empty() {
            doc.apply_delta(update, origin)?;
        }
        Ok(doc)
    }

    /// Subscribe to update events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentUpdate> {
        self.events.subscribe()
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    /// Full document state as a single update.
    pub fn encode_full(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that `since_vector` does not.
    ///
    /// An empty `since_vector` is treated as the empty state vector.
    pub fn encode_delta(&self, since_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = if since_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(since_vector)?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encoded state vector of this replica.
    pub fn current_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Current text content.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn len(&self) -> usize {
        self.content().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Merging ──────────────────────────────────────────────────────

    /// Merge a delta produced by another replica.
    ///
    /// Malformed bytes are rejected before the document is touched.
    ///
    /// Known risk: some corrupted inputs trip an unchecked `char` conversion
    /// inside the yrs v1 decoder. That aborts the process instead of returning
    /// [`DocumentError`], and `catch_unwind` cannot contain an abort. Deltas
    /// from authenticated peers are trusted not to be adversarial.
    pub fn apply_delta(&self, delta: &[u8], origin: Origin) -> Result<MergeOutcome, DocumentError> {
        let update = Update::decode_v1(delta)?;

        let changed = {
            let mut txn = self.doc.transact_mut();
            let before_sv = txn.state_vector();
            let before = self.text.get_string(&txn);
            txn.apply_update(update)
                .map_err(|e| DocumentError::Merge(e.to_string()))?;
            txn.state_vector() != before_sv || self.text.get_string(&txn) != before
        };

        self.emit(delta.to_vec(), origin, changed, None);
        Ok(MergeOutcome { changed })
    }

    // ─── Local editing ────────────────────────────────────────────────

    /// Insert `chunk` at byte offset `position`. Returns the produced delta.
    pub fn insert(&self, position: usize, chunk: &str) -> Result<Vec<u8>, DocumentError> {
        let delta = {
            let mut txn = self.doc.transact_mut();
            let current = self.text.get_string(&txn);
            check_position(&current, position)?;
            self.text.insert(&mut txn, position as u32, chunk);
            txn.encode_update_v1()
        };
        let edit = TextEdit::Insert {
            position,
            text: chunk.to_string(),
        };
        self.emit(delta.clone(), Origin::Local, !chunk.is_empty(), Some(edit));
        Ok(delta)
    }

    /// Remove `length` bytes starting at byte offset `position`.
    pub fn delete(&self, position: usize, length: usize) -> Result<Vec<u8>, DocumentError> {
        let delta = {
            let mut txn = self.doc.transact_mut();
            let current = self.text.get_string(&txn);
            check_position(&current, position)?;
            let end = position.saturating_add(length);
            if end > current.len() {
                return Err(DocumentError::OutOfBounds { position: end, len: current.len() });
            }
            check_position(&current, end)?;
            if length > 0 {
                self.text.remove_range(&mut txn, position as u32, length as u32);
            }
            txn.encode_update_v1()
        };
        self.emit(delta.clone(), Origin::Local, length > 0, Some(TextEdit::Delete { position, length }));
        Ok(delta)
    }

    /// Replace the whole buffer with `content` as one local edit.
    ///
    /// Used when an offline reconciliation settles on a new text.
    pub fn replace_content(&self, content: &str) -> Vec<u8> {
        let (delta, changed) = {
            let mut txn = self.doc.transact_mut();
            let current = self.text.get_string(&txn);
            if current == content {
                (txn.encode_update_v1(), false)
            } else {
                let len = self.text.len(&txn);
                if len > 0 {
                    self.text.remove_range(&mut txn, 0, len);
                }
                self.text.insert(&mut txn, 0, content);
                (txn.encode_update_v1(), true)
            }
        };
        let edit = TextEdit::Replace {
            content: content.to_string(),
        };
        self.emit(delta.clone(), Origin::Local, changed, Some(edit));
        delta
    }

    fn emit(&self, delta: Vec<u8>, origin: Origin, changed: bool, edit: Option<TextEdit>) {
        // No subscribers is not an error.
        let _ = self.events.send(DocumentUpdate {
            delta: Arc::new(delta),
            origin,
            changed,
            edit,
        });
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("client_id", &self.doc.client_id())
            .field("len", &self.len())
            .finish()
    }
}

fn check_position(content: &str, position: usize) -> Result<(), DocumentError> {
    if position > content.len() {
        return Err(DocumentError::OutOfBounds { position, len: content.len() });
    }
    if !content.is_char_boundary(position) {
        return Err(DocumentError::NotCharBoundary(position));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sync(from: &ReplicatedDocument, to: &ReplicatedDocument) {
        let delta = from.encode_delta(&to.current_vector()).unwrap();
        to.apply_delta(&delta, Origin::Remote { from: ConnectionId::new() }).unwrap();
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = ReplicatedDocument::new();
        assert!(doc.is_empty());
        assert_eq!(doc.content(), "");
    }

    #[test]
    fn test_local_insert_and_delete() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "hello world").unwrap();
        doc.delete(5, 6).unwrap();
        doc.insert(5, ", quire").unwrap();
        assert_eq!(doc.content(), "hello, quire");
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "abc").unwrap();
        assert_eq!(
            doc.insert(4, "x"),
            Err(DocumentError::OutOfBounds { position: 4, len: 3 })
        );
        assert!(doc.delete(2, 5).is_err());
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_insert_rejects_split_character() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "héllo").unwrap();
        assert_eq!(doc.insert(2, "x"), Err(DocumentError::NotCharBoundary(2)));
        doc.insert(3, "x").unwrap();
        assert_eq!(doc.content(), "héxllo");
    }

    #[test]
    fn test_full_state_roundtrip() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "line one\nline two").unwrap();

        let copy = ReplicatedDocument::from_update(&doc.encode_full(), Origin::InitialSync).unwrap();
        assert_eq!(copy.content(), doc.content());
        assert_eq!(
            StateVector::decode_v1(&copy.current_vector()).unwrap(),
            StateVector::decode_v1(&doc.current_vector()).unwrap()
        );
    }

    #[test]
    fn test_delta_since_vector_is_minimal() {
        let a = ReplicatedDocument::new();
        let b = ReplicatedDocument::new();
        a.insert(0, "shared").unwrap();
        sync(&a, &b);

        a.insert(6, " text").unwrap();
        let delta = a.encode_delta(&b.current_vector()).unwrap();
        assert!(delta.len() < a.encode_full().len());

        b.apply_delta(&delta, Origin::Remote { from: ConnectionId::new() }).unwrap();
        assert_eq!(b.content(), "shared text");
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let a = ReplicatedDocument::new();
        let b = ReplicatedDocument::new();
        a.insert(0, "base\n").unwrap();
        sync(&a, &b);

        let da = a.insert(0, "alpha ").unwrap();
        let db = b.insert(5, "beta").unwrap();

        b.apply_delta(&da, Origin::Remote { from: ConnectionId::new() }).unwrap();
        a.apply_delta(&db, Origin::Remote { from: ConnectionId::new() }).unwrap();

        assert_eq!(a.content(), b.content());
        assert!(a.content().contains("alpha "));
        assert!(a.content().contains("beta"));
    }

    #[test]
    fn test_duplicate_delta_is_idempotent() {
        let a = ReplicatedDocument::new();
        let b = ReplicatedDocument::new();
        let delta = a.insert(0, "once").unwrap();
        let origin = Origin::Remote { from: ConnectionId::new() };

        assert!(b.apply_delta(&delta, origin).unwrap().changed);
        assert!(!b.apply_delta(&delta, origin).unwrap().changed);
        assert_eq!(b.content(), "once");
    }

    #[test]
    fn test_malformed_delta_rejected() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "keep").unwrap();
        let err = doc
            .apply_delta(&[0x01, 0x02, 0x03], Origin::Remote { from: ConnectionId::new() })
            .unwrap_err();
        assert!(matches!(err, DocumentError::Decode(_)));
        assert_eq!(doc.content(), "keep");
    }

    #[test]
    fn test_malformed_state_vector_rejected() {
        let doc = ReplicatedDocument::new();
        assert!(doc.encode_delta(&[0xFF, 0xFF]).is_err());
        assert!(doc.encode_delta(&[]).is_ok());
    }

    #[test]
    fn test_events_carry_origin() {
        let doc = ReplicatedDocument::new();
        let mut rx = doc.subscribe();
        let peer = ConnectionId::new();

        let local = doc.insert(0, "abc").unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, Origin::Local);
        assert!(event.changed);
        assert_eq!(*event.delta, local);

        let other = ReplicatedDocument::new();
        let delta = other.insert(0, "xyz").unwrap();
        doc.apply_delta(&delta, Origin::Remote { from: peer }).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin.connection(), Some(peer));
        assert!(!event.origin.is_local());
    }

    #[test]
    fn test_dropped_subscriber_does_not_block() {
        let doc = ReplicatedDocument::new();
        let rx = doc.subscribe();
        drop(rx);
        doc.insert(0, "still fine").unwrap();
        assert_eq!(doc.content(), "still fine");
    }

    #[test]
    fn test_replace_content() {
        let doc = ReplicatedDocument::new();
        doc.insert(0, "old text").unwrap();
        let mut rx = doc.subscribe();

        doc.replace_content("new text");
        assert_eq!(doc.content(), "new text");
        assert!(rx.try_recv().unwrap().changed);

        doc.replace_content("new text");
        assert!(!rx.try_recv().unwrap().changed);
    }

    #[test]
    fn test_replace_content_propagates() {
        let a = ReplicatedDocument::new();
        let b = ReplicatedDocument::new();
        a.insert(0, "goodbye").unwrap();
        sync(&a, &b);

        let delta = b.replace_content("hello");
        a.apply_delta(&delta, Origin::Remote { from: ConnectionId::from(Uuid::new_v4()) })
            .unwrap();
        assert_eq!(a.content(), "hello");
    }
}
