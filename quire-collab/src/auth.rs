//! Session validation at connection upgrade.
//!
//! Identity is never taken from client-supplied fields. The gateway extracts a
//! pre-established session token from the upgrade request and hands it to a
//! [`SessionValidator`]; whatever user that returns is the identity for the
//! lifetime of the socket.

use std::collections::HashMap;
use std::path::Path;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity issued by the external session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub display_name: String,
}

impl AuthenticatedUser {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no session token presented")]
    MissingToken,
    #[error("session token rejected")]
    InvalidToken,
    #[error("session backend unavailable: {0}")]
    Backend(String),
}

/// Resolves a session token to a user.
///
/// Implemented by whatever owns HTTP sessions; the engine only consumes it.
pub trait SessionValidator: Send + Sync {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<AuthenticatedUser, AuthError>>;
}

/// Fixed token table, for development servers and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionValidator {
    sessions: HashMap<String, AuthenticatedUser>,
}

impl StaticSessionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, token: impl Into<String>, user: AuthenticatedUser) -> Self {
        self.insert(token, user);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user: AuthenticatedUser) {
        self.sessions.insert(token.into(), user);
    }

    /// Load a `{ "token": { "userId": .., "displayName": .. } }` table.
    pub fn from_json_file(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Backend(format!("{}: {e}", path.display())))?;
        let sessions: HashMap<String, AuthenticatedUser> =
            serde_json::from_str(&raw).map_err(|e| AuthError::Backend(e.to_string()))?;
        Ok(Self { sessions })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionValidator for StaticSessionValidator {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<AuthenticatedUser, AuthError>> {
        Box::pin(async move {
            if token.is_empty() {
                return Err(AuthError::MissingToken);
            }
            self.sessions.get(token).cloned().ok_or(AuthError::InvalidToken)
        })
    }
}
