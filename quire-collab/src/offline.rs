//! Offline editing and reconnect reconciliation.
//!
//! While disconnected, a client keeps editing its local replica and records
//! each edit as a [`PendingOperation`] plus the delta it produced. The
//! [`OfflineDocumentState`] is written to a cache directory as one JSON file
//! per `"projectId-fileId"` key, so it survives a restart.
//!
//! On reconnect the local text is compared against the freshly synced remote
//! text and resolved with a [`SyncStrategy`]:
//!
//! ```text
//! local  "a\nb\nc"        merge-changes      "a\n<<<<<<< Local\nb\n=======\nx\n>>>>>>> Remote\nc"
//! remote "a\nx\nc"   ─────────────────────►
//! ```
//!
//! Merging is line by line and by index. Concurrent edits inside the same
//! line are surfaced as a conflict block, never merged character-wise.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::document::TextEdit;
use crate::protocol::now_millis;

pub const MARKER_LOCAL: &str = "<<<<<<< Local";
pub const MARKER_SPLIT: &str = "=======";
pub const MARKER_REMOTE: &str = ">>>>>>> Remote";

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("offline cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("offline cache serialization failed: {0}")]
    Serialization(String),

    #[error("corrupt offline cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("document {0} is not offline")]
    NotOffline(String),

    #[error("document {0} has no reconciliation awaiting confirmation")]
    NothingToConfirm(String),

    #[error("unknown sync strategy '{0}'")]
    UnknownStrategy(String),
}

/// Cache key for a (project, file) pair.
pub fn cache_key(project_id: &str, file_id: &str) -> String {
    format!("{project_id}-{file_id}")
}

// ───────────────────────────────────────────────────────────────────
// Pending operations
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Retain,
}

/// One logical edit made while disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    pub timestamp: u64,
    pub user_id: String,
    #[serde(default)]
    pub applied: bool,
}

impl PendingOperation {
    fn new(kind: OperationKind, position: usize, user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            position,
            content: None,
            length: None,
            timestamp: now_millis(),
            user_id: user_id.into(),
            applied: false,
        }
    }

    pub fn insert(position: usize, content: impl Into<String>, user_id: impl Into<String>) -> Self {
        let content = content.into();
        let mut op = Self::new(OperationKind::Insert, position, user_id);
        op.length = Some(content.len());
        op.content = Some(content);
        op
    }

    pub fn delete(position: usize, length: usize, user_id: impl Into<String>) -> Self {
        let mut op = Self::new(OperationKind::Delete, position, user_id);
        op.length = Some(length);
        op
    }

    pub fn retain(position: usize, length: usize, user_id: impl Into<String>) -> Self {
        let mut op = Self::new(OperationKind::Retain, position, user_id);
        op.length = Some(length);
        op
    }

    /// Describe a replica edit. A whole-buffer replacement is recorded as a
    /// retain carrying the new content.
    pub fn from_edit(edit: &TextEdit, user_id: impl Into<String>) -> Self {
        match edit {
            TextEdit::Insert { position, text } => Self::insert(*position, text.clone(), user_id),
            TextEdit::Delete { position, length } => Self::delete(*position, *length, user_id),
            TextEdit::Replace { content } => {
                let mut op = Self::retain(0, content.len(), user_id);
                op.content = Some(content.clone());
                op
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cached state
// ───────────────────────────────────────────────────────────────────

/// Client-resident state of a document edited while disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineDocumentState {
    pub file_id: String,
    pub project_id: String,
    pub content: String,
    /// Millis since epoch of the last confirmed sync
    pub last_synced: u64,
    #[serde(with = "base64_list")]
    pub local_changes: Vec<Vec<u8>>,
    pub version: u64,
    pub is_offline: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_operations: Vec<PendingOperation>,
}

impl OfflineDocumentState {
    pub fn new(project_id: impl Into<String>, file_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            project_id: project_id.into(),
            content: content.into(),
            last_synced: now_millis(),
            local_changes: Vec::new(),
            version: 0,
            is_offline: true,
            pending_operations: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        cache_key(&self.project_id, &self.file_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_operations.is_empty()
    }

    /// Record one edit and the replica content after it.
    pub fn record(&mut self, op: PendingOperation, delta: Vec<u8>, content: impl Into<String>) {
        self.pending_operations.push(op);
        self.local_changes.push(delta);
        self.content = content.into();
        self.version += 1;
    }

    fn settle(&mut self, content: String) {
        self.content = content;
        self.pending_operations.clear();
        self.local_changes.clear();
        self.is_offline = false;
        self.last_synced = now_millis();
    }
}

mod base64_list {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(items.iter().map(|b| STANDARD.encode(b)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconciliation
// ───────────────────────────────────────────────────────────────────

/// How divergent local and remote text is resolved on reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategy {
    LocalWins,
    RemoteWins,
    #[default]
    MergeChanges,
    AskUser,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStrategy::LocalWins => "local-wins",
            SyncStrategy::RemoteWins => "remote-wins",
            SyncStrategy::MergeChanges => "merge-changes",
            SyncStrategy::AskUser => "ask-user",
        })
    }
}

impl FromStr for SyncStrategy {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-wins" => Ok(SyncStrategy::LocalWins),
            "remote-wins" => Ok(SyncStrategy::RemoteWins),
            "merge-changes" => Ok(SyncStrategy::MergeChanges),
            "ask-user" => Ok(SyncStrategy::AskUser),
            other => Err(OfflineError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local and remote text were already equal.
    Unchanged,
    /// `content` is the agreed text; the remote replica must be set to it.
    Resolved { content: String, conflicts: usize },
    /// `proposed` awaits confirmation through
    /// [`OfflineManager::complete_reconciliation`].
    NeedsConfirmation { proposed: String, conflicts: usize },
}

impl ReconcileOutcome {
    pub fn conflicts(&self) -> usize {
        match self {
            ReconcileOutcome::Unchanged => 0,
            ReconcileOutcome::Resolved { conflicts, .. }
            | ReconcileOutcome::NeedsConfirmation { conflicts, .. } => *conflicts,
        }
    }
}

/// Resolve `local` against `remote` with `strategy`.
pub fn reconcile_content(local: &str, remote: &str, strategy: SyncStrategy) -> ReconcileOutcome {
    if local == remote {
        return ReconcileOutcome::Unchanged;
    }
    let (merged, conflicts) = merge_lines(local, remote);
    match strategy {
        SyncStrategy::LocalWins => ReconcileOutcome::Resolved {
            content: local.to_string(),
            conflicts,
        },
        SyncStrategy::RemoteWins => ReconcileOutcome::Resolved {
            content: remote.to_string(),
            conflicts,
        },
        SyncStrategy::MergeChanges => ReconcileOutcome::Resolved {
            content: merged,
            conflicts,
        },
        SyncStrategy::AskUser => ReconcileOutcome::NeedsConfirmation {
            proposed: merged,
            conflicts,
        },
    }
}

/// Line-by-line merge. Returns the merged text and the number of conflict
/// blocks written.
pub fn merge_lines(local: &str, remote: &str) -> (String, usize) {
    let local_lines: Vec<&str> = local.split('\n').collect();
    let remote_lines: Vec<&str> = remote.split('\n').collect();
    let count = local_lines.len().max(remote_lines.len());

    let mut out: Vec<&str> = Vec::with_capacity(count);
    let mut conflicts = 0;
    for i in 0..count {
        let l = local_lines.get(i).copied().unwrap_or("");
        let r = remote_lines.get(i).copied().unwrap_or("");
        match (l == r, l.is_empty(), r.is_empty()) {
            (true, _, _) => out.push(l),
            (false, false, false) => {
                conflicts += 1;
                out.extend([MARKER_LOCAL, l, MARKER_SPLIT, r, MARKER_REMOTE]);
            }
            (false, true, _) => out.push(r),
            (false, _, true) => out.push(l),
        }
    }
    (out.join("\n"), conflicts)
}

// ───────────────────────────────────────────────────────────────────
// Durable cache
// ───────────────────────────────────────────────────────────────────

/// Directory of `"projectId-fileId.json"` files.
#[derive(Debug, Clone)]
pub struct OfflineCache {
    dir: PathBuf,
}

impl OfflineCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, project_id: &str, file_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", cache_key(project_id, file_id)))
    }

    pub async fn save(&self, state: &OfflineDocumentState) -> Result<(), OfflineError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(state).map_err(|e| OfflineError::Serialization(e.to_string()))?;

        // Write then rename so a crash never leaves a torn file.
        let path = self.path_for(&state.project_id, &state.file_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("Saved offline state {} (v{})", state.key(), state.version);
        Ok(())
    }

    pub async fn load(&self, project_id: &str, file_id: &str) -> Result<Option<OfflineDocumentState>, OfflineError> {
        let path = self.path_for(project_id, file_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| OfflineError::Corrupt {
            key: cache_key(project_id, file_id),
            reason: e.to_string(),
        })
    }

    /// Returns whether an entry existed.
    pub async fn remove(&self, project_id: &str, file_id: &str) -> Result<bool, OfflineError> {
        match tokio::fs::remove_file(self.path_for(project_id, file_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable entry in the directory. Corrupt files are skipped.
    pub async fn list(&self) -> Result<Vec<OfflineDocumentState>, OfflineError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<OfflineDocumentState>(&bytes) {
                Ok(state) => out.push(state),
                Err(e) => log::warn!("Skipping corrupt offline cache file {}: {e}", path.display()),
            }
        }
        Ok(out)
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

/// Result of [`OfflineManager::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub outcome: ReconcileOutcome,
    /// State after reconciliation. Cleared of pending work unless the
    /// outcome still needs confirmation.
    pub state: OfflineDocumentState,
}

/// Tracks offline documents for one client and drives reconciliation.
pub struct OfflineManager {
    cache: OfflineCache,
    strategy: SyncStrategy,
    states: HashMap<String, OfflineDocumentState>,
    awaiting: HashMap<String, String>,
}

impl OfflineManager {
    pub fn new(cache: OfflineCache, strategy: SyncStrategy) -> Self {
        Self {
            cache,
            strategy,
            states: HashMap::new(),
            awaiting: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: SyncStrategy) {
        self.strategy = strategy;
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.cache
    }

    pub fn state(&self, project_id: &str, file_id: &str) -> Option<&OfflineDocumentState> {
        self.states.get(&cache_key(project_id, file_id))
    }

    pub fn is_offline(&self, project_id: &str, file_id: &str) -> bool {
        self.state(project_id, file_id).is_some_and(|s| s.is_offline)
    }

    pub fn awaiting_confirmation(&self, project_id: &str, file_id: &str) -> Option<&str> {
        self.awaiting.get(&cache_key(project_id, file_id)).map(String::as_str)
    }

    /// Load a cached state left by a previous process, if any.
    pub async fn restore(&mut self, project_id: &str, file_id: &str) -> Result<Option<&OfflineDocumentState>, OfflineError> {
        let key = cache_key(project_id, file_id);
        if !self.states.contains_key(&key) {
            match self.cache.load(project_id, file_id).await? {
                Some(state) => {
                    log::info!(
                        "Restored offline state {key} with {} pending operations",
                        state.pending_operations.len()
                    );
                    self.states.insert(key.clone(), state);
                }
                None => return Ok(None),
            }
        }
        Ok(self.states.get(&key))
    }

    /// Enter offline mode for a document. An existing offline state is kept.
    pub async fn begin_offline(&mut self, project_id: &str, file_id: &str, content: &str) -> Result<(), OfflineError> {
        let key = cache_key(project_id, file_id);
        if self.states.get(&key).is_some_and(|s| s.is_offline) {
            return Ok(());
        }
        let state = OfflineDocumentState::new(project_id, file_id, content);
        self.cache.save(&state).await?;
        self.states.insert(key.clone(), state);
        log::info!("Document {key} is now offline");
        Ok(())
    }

    /// Queue an edit made while offline and persist the new state.
    pub async fn record_change(
        &mut self,
        project_id: &str,
        file_id: &str,
        op: PendingOperation,
        delta: Vec<u8>,
        content: &str,
    ) -> Result<(), OfflineError> {
        let key = cache_key(project_id, file_id);
        let state = self
            .states
            .get_mut(&key)
            .filter(|s| s.is_offline)
            .ok_or(OfflineError::NotOffline(key))?;
        state.record(op, delta, content);
        self.cache.save(state).await
    }

    /// Resolve the offline text against `remote_content` with the configured
    /// strategy.
    pub async fn reconcile(
        &mut self,
        project_id: &str,
        file_id: &str,
        remote_content: &str,
    ) -> Result<Reconciliation, OfflineError> {
        let key = cache_key(project_id, file_id);
        let (outcome, pending) = match self.states.get(&key) {
            Some(state) => (
                reconcile_content(&state.content, remote_content, self.strategy),
                state.pending_operations.len(),
            ),
            None => return Err(OfflineError::NotOffline(key)),
        };
        log::info!(
            "Reconciling {key} ({}, {pending} pending, {} conflicts)",
            self.strategy,
            outcome.conflicts()
        );

        let state = match &outcome {
            ReconcileOutcome::Unchanged => self.finish(project_id, file_id, remote_content.to_string()).await?,
            ReconcileOutcome::Resolved { content, .. } => self.finish(project_id, file_id, content.clone()).await?,
            ReconcileOutcome::NeedsConfirmation { proposed, .. } => {
                self.awaiting.insert(key.clone(), proposed.clone());
                self.states
                    .get(&key)
                    .cloned()
                    .ok_or(OfflineError::NotOffline(key))?
            }
        };
        Ok(Reconciliation { outcome, state })
    }

    /// Settle an `ask-user` reconciliation with the text the user accepted.
    pub async fn complete_reconciliation(
        &mut self,
        project_id: &str,
        file_id: &str,
        accepted: &str,
    ) -> Result<OfflineDocumentState, OfflineError> {
        let key = cache_key(project_id, file_id);
        if self.awaiting.remove(&key).is_none() {
            return Err(OfflineError::NothingToConfirm(key));
        }
        self.finish(project_id, file_id, accepted.to_string()).await
    }

    /// Drop any offline state without reconciling.
    pub async fn discard(&mut self, project_id: &str, file_id: &str) -> Result<bool, OfflineError> {
        let key = cache_key(project_id, file_id);
        self.awaiting.remove(&key);
        let had = self.states.remove(&key).is_some();
        Ok(self.cache.remove(project_id, file_id).await? || had)
    }

    async fn finish(&mut self, project_id: &str, file_id: &str, content: String) -> Result<OfflineDocumentState, OfflineError> {
        let key = cache_key(project_id, file_id);
        let mut state = self
            .states
            .remove(&key)
            .ok_or_else(|| OfflineError::NotOffline(key.clone()))?;
        self.awaiting.remove(&key);
        state.settle(content);
        self.cache.remove(project_id, file_id).await?;
        Ok(state)
    }
}
