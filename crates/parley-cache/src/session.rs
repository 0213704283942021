//! Conversation sessions with sliding expiration.
//!
//! Sessions are stored as JSON documents under `session:{id}` with a TTL that
//! is re-applied on every read, and indexed per user under the set
//! `user_sessions:{user_id}`. The index set is re-expired on every write so it
//! never outlives its newest member by more than one session TTL.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, to_chrono};
use crate::error::{Error, Result};

/// Namespace for session documents.
pub const SESSION_PREFIX: &str = "session";

/// Namespace for the user → sessions reverse index.
pub const USER_SESSIONS_PREFIX: &str = "user_sessions";

/// Client metadata captured when a session or connection starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Free-form device description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<String>,
    /// Remote IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// HTTP user agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One message in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl SessionMessage {
    /// Create a message stamped with the current time.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A logical conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Open key/value context shared with the conversation engine.
    #[serde(default)]
    pub context: Map<String, Value>,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub client: ClientInfo,
    /// Ordered transcript.
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
}

impl Session {
    /// Create an active session that expires `ttl` from now.
    pub fn new(
        session_id: impl Into<String>,
        user_id: Option<String>,
        client: ClientInfo,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id,
            started_at: now,
            last_activity: now,
            context: Map::new(),
            is_active: true,
            expires_at: now + to_chrono(ttl),
            client,
            messages: Vec::new(),
        }
    }

    /// Mark activity now and push expiry out to `now + ttl`.
    pub fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.last_activity = now;
        self.expires_at = now + to_chrono(ttl);
    }

    /// Append a user message to the transcript.
    pub fn push_user_message(&mut self, content: impl Into<String>) {
        self.messages
            .push(SessionMessage::new(MessageRole::User, content));
    }

    /// Append an assistant message to the transcript.
    pub fn push_assistant_message(
        &mut self,
        content: impl Into<String>,
        metadata: Map<String, Value>,
    ) {
        self.messages.push(
            SessionMessage::new(MessageRole::Assistant, content).with_metadata(metadata),
        );
    }

    /// Number of transcript messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Session CRUD over the shared cache store.
#[derive(Clone)]
pub struct SessionCache {
    store: CacheStore,
    ttl: Duration,
}

impl SessionCache {
    /// Create a session cache with the given sliding TTL.
    pub fn new(store: CacheStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Sliding lifetime applied on every read and write.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn session_key(session_id: &str) -> String {
        CacheStore::generate_key(SESSION_PREFIX, session_id)
    }

    fn user_key(user_id: &str) -> String {
        CacheStore::generate_key(USER_SESSIONS_PREFIX, user_id)
    }

    /// Build an unsaved session with this cache's TTL.
    pub fn new_session(
        &self,
        session_id: impl Into<String>,
        user_id: Option<String>,
        client: ClientInfo,
    ) -> Session {
        Session::new(session_id, user_id, client, self.ttl)
    }

    /// Create and store a new session. Returns its id.
    pub async fn create(&self, user_id: Option<&str>, client: ClientInfo) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let session = self.new_session(session_id.clone(), user_id.map(str::to_string), client);
        self.write(&session).await?;

        debug!(session_id = %session_id, user_id = ?user_id, "Session created");
        Ok(session_id)
    }

    /// Load a session and extend its life (sliding expiration).
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(None);
        };

        session.touch(self.ttl);
        self.write(&session).await?;

        trace!(session_id = %session_id, "Session refreshed on read");
        Ok(Some(session))
    }

    /// Load a session without refreshing it.
    pub async fn peek(&self, session_id: &str) -> Result<Option<Session>> {
        self.load(session_id).await
    }

    /// Overwrite a stored session and reset its TTL.
    ///
    /// If the owner changed, the session leaves the previous owner's index.
    pub async fn update(&self, session_id: &str, session: &Session) -> Result<()> {
        let previous_owner = self.load(session_id).await?.and_then(|s| s.user_id);

        let mut session = session.clone();
        session.session_id = session_id.to_string();
        session.touch(self.ttl);
        self.write(&session).await?;

        if let Some(previous) = previous_owner {
            if session.user_id.as_deref() != Some(previous.as_str()) {
                self.store
                    .backend()
                    .srem(&Self::user_key(&previous), session_id)
                    .await?;
                debug!(session_id = %session_id, from = %previous, to = ?session.user_id, "Session owner changed");
            }
        }
        Ok(())
    }

    /// Delete a session and drop it from its owner's index.
    /// Returns whether the session existed.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let owner = self.load(session_id).await?.and_then(|s| s.user_id);
        let existed = self.store.delete(&Self::session_key(session_id)).await?;

        if let Some(user_id) = owner {
            self.store
                .backend()
                .srem(&Self::user_key(&user_id), session_id)
                .await?;
        }

        if existed {
            debug!(session_id = %session_id, "Session deleted");
        }
        Ok(existed)
    }

    /// All live sessions for a user.
    ///
    /// Index members whose document has already expired, or that now belong
    /// to someone else, are skipped and pruned from the index.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let user_key = Self::user_key(user_id);
        let backend = self.store.backend();

        let members = backend.smembers(&user_key).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = members.iter().map(|id| Self::session_key(id)).collect();
        let raws = backend.get_many(&keys).await?;

        let mut sessions = Vec::with_capacity(members.len());
        for (member, raw) in members.iter().zip(raws) {
            let Some(raw) = raw else {
                trace!(user_id = %user_id, session_id = %member, "Pruning stale index member");
                backend.srem(&user_key, member).await?;
                continue;
            };
            match CacheStore::deserialize::<Session>(&raw) {
                Ok(session) if session.user_id.as_deref() == Some(user_id) => sessions.push(session),
                Ok(_) => {
                    trace!(user_id = %user_id, session_id = %member, "Pruning reassigned index member");
                    backend.srem(&user_key, member).await?;
                }
                Err(e) => {
                    warn!(session_id = %member, error = %e, "Skipping undecodable session");
                }
            }
        }

        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    /// Delete session documents whose remaining TTL is zero or missing.
    ///
    /// Native expiry normally removes them first; this catches backends that
    /// expose keys before expiry fires and documents written without a TTL.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let backend = self.store.backend();
        let pattern = CacheStore::generate_key(SESSION_PREFIX, "*");
        let mut removed = 0;

        for key in backend.keys(&pattern).await? {
            if !backend.ttl(&key).await?.is_stale() {
                continue;
            }
            let session_id = key
                .strip_prefix(SESSION_PREFIX)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(&key)
                .to_string();

            if self.delete(&session_id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(count = removed, "Swept expired sessions");
        }
        Ok(removed)
    }

    /// Liveness probe used by health checks.
    pub async fn probe(&self) -> bool {
        self.peek("__health_probe__").await.is_ok()
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        match self
            .store
            .get_value::<Session>(&Self::session_key(session_id))
            .await
        {
            Ok(session) => Ok(session),
            Err(Error::Serialization(e)) => {
                warn!(session_id = %session_id, error = %e, "Undecodable session payload, treating as miss");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&self, session: &Session) -> Result<()> {
        self.store
            .set_value(&Self::session_key(&session.session_id), session, self.ttl)
            .await?;

        if let Some(user_id) = &session.user_id {
            self.store
                .backend()
                .sadd_ex(&Self::user_key(user_id), &session.session_id, self.ttl)
                .await?;
        }
        Ok(())
    }
}
