//! Session Management
//!
//! Sessions hold the canonical history of one chat. Stores persist them;
//! the [`SessionTable`] serializes turns on the same session id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::Conversation;

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Owner, used for username-scoped tools and log file names
    pub username: Option<String>,

    /// Model key used for this session
    pub model: String,
}

/// A complete agent session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Conversation history
    pub conversation: Conversation,

    /// Session metadata
    pub metadata: SessionMetadata,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    /// Create with specific ID
    pub fn with_id(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation: Conversation::new(),
            metadata: SessionMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Message count
    pub fn message_count(&self) -> usize {
        self.conversation.len()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Session store trait for persistence
pub trait SessionStore: Send + Sync {
    /// Save a session
    fn save(&self, session: &Session) -> Result<()>;

    /// Load a session by ID
    fn load(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Delete a session
    fn delete(&self, id: &SessionId) -> Result<()>;

    /// List sessions for a user, most recent first
    fn list(&self, username: Option<&str>, limit: usize) -> Result<Vec<Session>>;
}

fn sort_and_limit(sessions: &mut Vec<Session>, limit: usize) {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    sessions.truncate(limit);
}

/// In-memory session store (for development/testing)
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> AgentError {
    AgentError::Session("session store lock poisoned".into())
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        Ok(sessions.get(id).cloned())
    }

    fn delete(&self, id: &SessionId) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        sessions.remove(id);
        Ok(())
    }

    fn list(&self, username: Option<&str>, limit: usize) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        let mut result: Vec<_> = sessions
            .values()
            .filter(|s| username.is_none_or(|u| s.metadata.username.as_deref() == Some(u)))
            .cloned()
            .collect();
        sort_and_limit(&mut result, limit);
        Ok(result)
    }
}

/// Name part reduced to characters safe in a file name
fn file_part(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// One JSON document per session, named `<username|unknown>-<session_id>.json`.
///
/// Both name parts are reduced to `[A-Za-z0-9_-]`, so a log never lands
/// outside the store directory.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a session's log file
    pub fn path_for(&self, session: &Session) -> PathBuf {
        let owner = session
            .metadata
            .username
            .as_deref()
            .map(file_part)
            .filter(|owner| !owner.is_empty())
            .unwrap_or_else(|| "unknown".into());
        self.dir.join(format!("{owner}-{}.json", file_part(session.id.as_str())))
    }

    fn find(&self, id: &SessionId) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let suffix = format!("-{}.json", file_part(id.as_str()));
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn read(path: &Path) -> Result<Session> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(session);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(session)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        self.find(id)?.map(|path| Self::read(&path)).transpose()
    }

    fn delete(&self, id: &SessionId) -> Result<()> {
        if let Some(path) = self.find(id)? {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn list(&self, username: Option<&str>, limit: usize) -> Result<Vec<Session>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(session) => {
                    if username.is_none_or(|u| session.metadata.username.as_deref() == Some(u)) {
                        result.push(session);
                    }
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session log"),
            }
        }
        sort_and_limit(&mut result, limit);
        Ok(result)
    }
}

/// Live sessions, each behind an async mutex held for a whole turn
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<std::sync::Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<Session>>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `id`, creating the entry with `init` on first use
    pub fn handle(
        &self,
        id: &SessionId,
        init: impl FnOnce() -> Session,
    ) -> Arc<tokio::sync::Mutex<Session>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(init()))),
        )
    }

    pub fn remove(&self, id: &SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
