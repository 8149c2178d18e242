//! Session Management
//!
//! A session is a durable, append-only conversation. [`SessionManager`] is
//! the single mutation point: every append goes through a [`SessionStore`]
//! and is durable before it returns. Run exclusivity is enforced by a lease
//! keyed by session id; [`RunLease`] releases it on drop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::{Message, MessageLog, Role};

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
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

/// Short rolling summary of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub summary: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,

    pub last_updated: DateTime<Utc>,
}

/// Session metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Session title (auto-generated or user-set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// User/owner ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,

    /// Extra key-value metadata
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A complete agent session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,

    /// Session metadata
    #[serde(default)]
    pub metadata: SessionMetadata,

    /// Conversation history
    #[serde(default)]
    pub messages: MessageLog,
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
            created_at: now,
            updated_at: now,
            metadata: SessionMetadata::default(),
            messages: MessageLog::new(),
        }
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Get or generate title
    pub fn title(&self) -> String {
        self.metadata.title.clone().unwrap_or_else(|| {
            // Generate from first user message
            self.messages
                .messages()
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| {
                    let text = m.text();
                    let preview: String = text.chars().take(50).collect();
                    if text.chars().count() > 50 {
                        format!("{preview}...")
                    } else {
                        preview
                    }
                })
                .unwrap_or_else(|| {
                    let short: String = self.id.as_str().chars().take(8).collect();
                    format!("Session {short}")
                })
        })
    }

    /// Message count
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable storage contract.
///
/// `append` must be atomic and durable before it returns and must preserve
/// total order. `lease`/`release` implement run exclusivity.
pub trait SessionStore: Send + Sync {
    /// Persist a new session record. Fails if the id already exists.
    fn create(&self, session: &Session) -> Result<()>;

    /// Append one message, returning its sequence number
    fn append(&self, id: &SessionId, message: &Message) -> Result<u64>;

    /// Load a session by ID
    fn read(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Replace the metadata record
    fn update_metadata(&self, id: &SessionId, metadata: &SessionMetadata) -> Result<()>;

    /// Delete a session, returning whether it existed
    fn delete(&self, id: &SessionId) -> Result<bool>;

    /// Session ids, most recently active first
    fn list(&self, limit: usize) -> Result<Vec<SessionId>>;

    /// Take the run lease, failing with `SessionBusy` if held
    fn lease(&self, id: &SessionId) -> Result<()>;

    /// Give the run lease back
    fn release(&self, id: &SessionId) -> Result<()>;
}

fn poisoned<T>(_: T) -> AgentError {
    AgentError::Storage("session store lock poisoned".into())
}

/// In-memory session store (for development/testing)
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    leases: Mutex<HashSet<SessionId>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        if sessions.contains_key(&session.id) {
            return Err(AgentError::Storage(format!("session {} already exists", session.id)));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn append(&self, id: &SessionId, message: &Message) -> Result<u64> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?;
        let seq = session.messages.push(message.clone());
        session.touch();
        Ok(seq)
    }

    fn read(&self, id: &SessionId) -> Result<Option<Session>> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        Ok(sessions.get(id).cloned())
    }

    fn update_metadata(&self, id: &SessionId, metadata: &SessionMetadata) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?;
        session.metadata = metadata.clone();
        session.touch();
        Ok(())
    }

    fn delete(&self, id: &SessionId) -> Result<bool> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        Ok(sessions.remove(id).is_some())
    }

    fn list(&self, limit: usize) -> Result<Vec<SessionId>> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        let mut result: Vec<_> = sessions.values().collect();
        // Sort by updated_at descending
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result.into_iter().take(limit).map(|s| s.id.clone()).collect())
    }

    fn lease(&self, id: &SessionId) -> Result<()> {
        let mut leases = self.leases.lock().map_err(poisoned)?;
        if !leases.insert(id.clone()) {
            return Err(AgentError::SessionBusy(id.to_string()));
        }
        Ok(())
    }

    fn release(&self, id: &SessionId) -> Result<()> {
        self.leases.lock().map_err(poisoned)?.remove(id);
        Ok(())
    }
}

/// Owns session identity, lifecycle and the single append path
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// In-memory manager
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Create and persist an empty session
    pub fn create(&self) -> Result<Session> {
        self.create_with_metadata(SessionMetadata::default())
    }

    pub fn create_with_metadata(&self, metadata: SessionMetadata) -> Result<Session> {
        let mut session = Session::new();
        session.metadata = metadata;
        self.store.create(&session)?;
        tracing::debug!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// Load the durable record
    pub fn load(&self, id: &SessionId) -> Result<Session> {
        self.store
            .read(id)?
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
    }

    /// Append outside of a run. Fails with `SessionBusy` while a run is active.
    pub fn append(&self, id: &SessionId, message: Message) -> Result<Message> {
        let lease = self.begin_run(id)?;
        lease.append(message)
    }

    /// Consistent point-in-time copy of the durable record
    pub fn snapshot(&self, id: &SessionId) -> Result<Session> {
        self.load(id)
    }

    /// Take the run lease for `id`
    pub fn begin_run(&self, id: &SessionId) -> Result<RunLease> {
        if self.store.read(id)?.is_none() {
            return Err(AgentError::SessionNotFound(id.to_string()));
        }
        self.store.lease(id)?;
        tracing::debug!(session_id = %id, "Run lease acquired");
        Ok(RunLease {
            store: Arc::clone(&self.store),
            id: id.clone(),
        })
    }

    /// Explicit destruction; refuses while a run is active
    pub fn delete(&self, id: &SessionId) -> Result<bool> {
        let _lease = self.begin_run(id)?;
        let existed = self.store.delete(id)?;
        tracing::info!(session_id = %id, "Session deleted");
        Ok(existed)
    }

    pub fn list(&self, limit: usize) -> Result<Vec<SessionId>> {
        self.store.list(limit)
    }

    /// Store a session summary in metadata
    pub fn set_summary(
        &self,
        id: &SessionId,
        summary: impl Into<String>,
        topics: Vec<String>,
    ) -> Result<Session> {
        let _lease = self.begin_run(id)?;
        let mut session = self.load(id)?;
        session.metadata.summary = Some(SessionSummary {
            summary: summary.into(),
            topics,
            last_updated: Utc::now(),
        });
        self.store.update_metadata(id, &session.metadata)?;
        Ok(session)
    }
}

/// Exclusive right to mutate one session; released on drop
pub struct RunLease {
    store: Arc<dyn SessionStore>,
    id: SessionId,
}

impl RunLease {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Durably append, returning the message stamped with its sequence number
    pub fn append(&self, mut message: Message) -> Result<Message> {
        message.seq = self.store.append(&self.id, &message)?;
        Ok(message)
    }

    /// Reload the durable record
    pub fn load(&self) -> Result<Session> {
        self.store
            .read(&self.id)?
            .ok_or_else(|| AgentError::SessionNotFound(self.id.to_string()))
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Err(e) = self.store.release(&self.id) {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to release run lease");
        } else {
            tracing::debug!(session_id = %self.id, "Run lease released");
        }
    }
}
