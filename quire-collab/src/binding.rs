//! Bridge between an editor widget and a replicated document.
//!
//! ```text
//!  editor keystroke ──local_edit()──► ReplicatedDocument (Origin::Local) ──► SyncClient
//!  editor ◄── set_content ── mirror task ◄── DocumentUpdate (not local)
//!  editor ◄── set/remove_decoration ── apply_presence() ◄── SyncEvent::Presence
//!  cursor ──local_cursor()── throttle ──► cursor sink
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::awareness::{AwarenessEntry, AwarenessPayload, CursorPosition};
use crate::document::{DocumentError, DocumentUpdate, ReplicatedDocument, TextEdit};
use crate::session::ConnectionId;

/// Default gap between forwarded local cursor moves.
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(100);

/// A remote user's cursor as the editor should draw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoration {
    pub client_id: ConnectionId,
    pub user_id: String,
    pub label: String,
    pub color: String,
    pub cursor: CursorPosition,
}

impl Decoration {
    fn from_entry(entry: &AwarenessEntry, cursor: CursorPosition) -> Self {
        Self {
            client_id: entry.client_id,
            user_id: entry.user_id.clone(),
            label: entry.display_name.clone(),
            color: entry.color.clone(),
            cursor,
        }
    }
}

/// What the binding needs from an editor widget.
pub trait EditorHandle: Send + 'static {
    fn content(&self) -> String;

    /// Replace the buffer with text merged from elsewhere.
    fn set_content(&mut self, content: &str);

    /// Add or move the decoration of one remote connection.
    fn set_decoration(&mut self, decoration: Decoration);

    fn remove_decoration(&mut self, client_id: ConnectionId);
}

/// Live two-way binding. Dropping it disposes it.
pub struct EditorBinding<E: EditorHandle> {
    editor: Arc<Mutex<E>>,
    doc: Arc<ReplicatedDocument>,
    mirror: Option<JoinHandle<()>>,
    local_client: Option<ConnectionId>,
    presence: BTreeMap<ConnectionId, AwarenessEntry>,
    decorated: BTreeSet<ConnectionId>,
    cursor_sink: Option<mpsc::Sender<Option<CursorPosition>>>,
    cursor_throttle: Duration,
    last_cursor: Option<Instant>,
}

impl<E: EditorHandle> EditorBinding<E> {
    /// Bind `editor` to `doc`. Must be called inside a Tokio runtime.
    ///
    /// The editor is first reset to the document's content.
    pub fn bind(editor: E, doc: Arc<ReplicatedDocument>) -> Self {
        let editor = Arc::new(Mutex::new(editor));
        let events = doc.subscribe();
        push_content(&doc, &editor);
        let mirror = tokio::spawn(mirror_remote(doc.clone(), editor.clone(), events));

        Self {
            editor,
            doc,
            mirror: Some(mirror),
            local_client: None,
            presence: BTreeMap::new(),
            decorated: BTreeSet::new(),
            cursor_sink: None,
            cursor_throttle: CURSOR_THROTTLE,
            last_cursor: None,
        }
    }

    /// Our own connection id. Its presence is never decorated.
    pub fn with_local_client(mut self, client_id: ConnectionId) -> Self {
        self.local_client = Some(client_id);
        self
    }

    /// Where throttled local cursor moves go.
    pub fn with_cursor_sink(mut self, sink: mpsc::Sender<Option<CursorPosition>>) -> Self {
        self.cursor_sink = Some(sink);
        self
    }

    pub fn with_cursor_throttle(mut self, throttle: Duration) -> Self {
        self.cursor_throttle = throttle;
        self
    }

    pub fn set_local_client(&mut self, client_id: ConnectionId) {
        self.local_client = Some(client_id);
        self.remove_decoration(client_id);
    }

    pub fn is_disposed(&self) -> bool {
        self.mirror.is_none()
    }

    /// Run `f` against the editor.
    pub fn with_editor<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        f(&mut lock(&self.editor))
    }

    /// Mirror an edit the user made in the editor into the document.
    pub fn local_edit(&self, edit: &TextEdit) -> Result<(), DocumentError> {
        if self.is_disposed() {
            return Ok(());
        }
        match edit {
            TextEdit::Insert { position, text } => self.doc.insert(*position, text).map(drop),
            TextEdit::Delete { position, length } => self.doc.delete(*position, *length).map(drop),
            TextEdit::Replace { content } => {
                self.doc.replace_content(content);
                Ok(())
            }
        }
    }

    /// Forward a local cursor move, at most once per throttle interval.
    ///
    /// Returns whether the move was forwarded.
    pub fn local_cursor(&mut self, cursor: Option<CursorPosition>) -> bool {
        if self.is_disposed() {
            return false;
        }
        let now = Instant::now();
        if self
            .last_cursor
            .is_some_and(|last| now.duration_since(last) < self.cursor_throttle)
        {
            return false;
        }
        let Some(sink) = &self.cursor_sink else {
            return false;
        };
        if sink.try_send(cursor).is_err() {
            log::trace!("Cursor sink full, dropping move");
            return false;
        }
        self.last_cursor = Some(now);
        true
    }

    /// Replace the remote presence view with a full awareness set.
    pub fn apply_presence(&mut self, payload: &AwarenessPayload) {
        if self.is_disposed() {
            return;
        }
        let current: BTreeMap<_, _> = payload
            .entries
            .iter()
            .filter(|e| Some(e.client_id) != self.local_client)
            .map(|e| (e.client_id, e.clone()))
            .collect();

        let gone: Vec<_> = self
            .decorated
            .iter()
            .filter(|id| current.get(id).and_then(|e| e.cursor).is_none())
            .copied()
            .collect();
        for id in gone {
            self.remove_decoration(id);
        }

        let mut editor = lock(&self.editor);
        for entry in current.values() {
            if let Some(cursor) = entry.cursor {
                editor.set_decoration(Decoration::from_entry(entry, cursor));
                self.decorated.insert(entry.client_id);
            }
        }
        drop(editor);
        self.presence = current;
    }

    /// Move one remote cursor, as announced by a `cursor_move` message.
    pub fn apply_cursor_move(&mut self, client_id: ConnectionId, cursor: Option<CursorPosition>) {
        if self.is_disposed() || Some(client_id) == self.local_client {
            return;
        }
        let Some(entry) = self.presence.get_mut(&client_id) else {
            log::trace!("Cursor move for unknown connection {client_id}");
            return;
        };
        entry.cursor = cursor;
        match cursor {
            Some(cursor) => {
                let decoration = Decoration::from_entry(entry, cursor);
                lock(&self.editor).set_decoration(decoration);
                self.decorated.insert(client_id);
            }
            None => self.remove_decoration(client_id),
        }
    }

    /// Remote connections currently decorated.
    pub fn decorated(&self) -> impl Iterator<Item = &ConnectionId> {
        self.decorated.iter()
    }

    /// Stop mirroring and clear every decoration. Safe to call twice.
    pub fn dispose(&mut self) {
        let Some(mirror) = self.mirror.take() else {
            return;
        };
        mirror.abort();
        let mut editor = lock(&self.editor);
        for id in std::mem::take(&mut self.decorated) {
            editor.remove_decoration(id);
        }
        self.presence.clear();
        self.cursor_sink = None;
    }

    fn remove_decoration(&mut self, client_id: ConnectionId) {
        if self.decorated.remove(&client_id) {
            lock(&self.editor).remove_decoration(client_id);
        }
    }
}

impl<E: EditorHandle> Drop for EditorBinding<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<E>(editor: &Mutex<E>) -> MutexGuard<'_, E> {
    editor.lock().unwrap_or_else(|e| e.into_inner())
}

fn push_content<E: EditorHandle>(doc: &ReplicatedDocument, editor: &Mutex<E>) {
    let content = doc.content();
    let mut editor = lock(editor);
    if editor.content() != content {
        editor.set_content(&content);
    }
}

async fn mirror_remote<E: EditorHandle>(
    doc: Arc<ReplicatedDocument>,
    editor: Arc<Mutex<E>>,
    mut events: broadcast::Receiver<DocumentUpdate>,
) {
    loop {
        match events.recv().await {
            Ok(update) if !update.origin.is_local() && update.changed => push_content(&doc, &editor),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => push_content(&doc, &editor),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
