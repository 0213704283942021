//! WebSocket message handlers.
//!
//! One inbound frame is handled at a time per connection. A chat message
//! moves through validation, session resolution, the engine call and
//! streaming before the transcript is persisted.

use std::sync::Arc;

use futures::StreamExt;
use parley_cache::{CacheService, Session};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::protocol::{ChatRequest, ClientRequest, Envelope, ErrorType, parse_request};
use crate::engine::{ConversationEngine, User};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The connection was not registered; nothing was sent.
    Disconnected,
    /// Answered a ping.
    Pong,
    /// Answered a session info request.
    SessionInfo,
    /// The frame was rejected with an error envelope.
    Rejected(ErrorType),
    /// The reply streamed to completion.
    Completed { chunks: usize },
    /// The connection went away while the reply was streaming.
    Interrupted { chunks: usize },
    /// The engine failed before or during the reply.
    EngineFailed,
}

/// How a reply stream ended.
enum StreamEnd {
    Completed,
    Interrupted,
    Failed,
}

/// Routes inbound frames for registered connections.
#[derive(Clone)]
pub struct SessionMessageHandler {
    registry: Arc<ConnectionRegistry>,
    cache: Arc<CacheService>,
    engine: Arc<dyn ConversationEngine>,
    rate_limit_chat: bool,
}

impl SessionMessageHandler {
    /// Create a handler. Chat messages are rate limited when `rate_limit_chat` is set.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        cache: Arc<CacheService>,
        engine: Arc<dyn ConversationEngine>,
        rate_limit_chat: bool,
    ) -> Self {
        Self {
            registry,
            cache,
            engine,
            rate_limit_chat,
        }
    }

    /// Handle one raw frame from `connection_id`.
    pub async fn handle_message(&self, connection_id: ConnectionId, raw: &str) -> MessageOutcome {
        let Some(connection) = self.registry.get(connection_id) else {
            return MessageOutcome::Disconnected;
        };
        self.registry.touch(connection_id);

        let request = match parse_request(raw, Some(&connection.session_id)) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Rejected message");
                self.registry
                    .send_personal(&e.to_envelope(), connection_id)
                    .await;
                return MessageOutcome::Rejected(e.error_type);
            }
        };

        match request {
            ClientRequest::Ping => {
                self.registry
                    .send_personal(&Envelope::pong(), connection_id)
                    .await;
                MessageOutcome::Pong
            }
            ClientRequest::SessionInfo { session_id } => {
                self.handle_session_info(&connection, &session_id).await
            }
            ClientRequest::Chat(chat) => self.handle_chat(&connection, chat).await,
        }
    }

    async fn handle_session_info(&self, connection: &Connection, session_id: &str) -> MessageOutcome {
        let session = match self.cache.sessions().peek(session_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to load session");
                None
            }
        };
        let message_count = session.as_ref().map_or(0, Session::message_count);

        let data = json!({
            "session": session,
            "message_count": message_count,
            "connection": connection,
        });
        self.registry
            .send_personal(&Envelope::session_info(session_id, data), connection.connection_id)
            .await;
        MessageOutcome::SessionInfo
    }

    /// Returns false if the message must be refused.
    async fn admit_chat(&self, connection: &Connection, user_id: Option<&str>) -> bool {
        if !self.rate_limit_chat {
            return true;
        }
        let limits = self.cache.rate_limits();
        let result = match (user_id, connection.client_info.ip_address.as_deref()) {
            (Some(user_id), _) => limits.check_user_rate_limit(user_id).await,
            (None, Some(ip)) => limits.check_ip_rate_limit(ip).await,
            (None, None) => return true,
        };
        result.allowed
    }

    async fn persist(&self, session_id: &str, session: &Session) {
        if let Err(e) = self.cache.sessions().update(session_id, session).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist session");
        }
    }

    async fn handle_chat(&self, connection: &Connection, chat: ChatRequest) -> MessageOutcome {
        let connection_id = connection.connection_id;
        let session_id = chat.session_id.as_str();
        let user_id = chat.user_id.clone().or_else(|| connection.user_id.clone());

        if !self.admit_chat(connection, user_id.as_deref()).await {
            self.registry
                .send_personal(
                    &Envelope::error(ErrorType::RateLimited, "Rate limit exceeded"),
                    connection_id,
                )
                .await;
            return MessageOutcome::Rejected(ErrorType::RateLimited);
        }

        let sessions = self.cache.sessions();
        let mut session = match sessions.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                sessions.new_session(session_id, user_id.clone(), connection.client_info.clone())
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session lookup failed, starting fresh");
                sessions.new_session(session_id, user_id.clone(), connection.client_info.clone())
            }
        };
        if session.user_id.is_none() {
            session.user_id = user_id.clone();
        }
        session.push_user_message(chat.content.as_str());
        self.persist(session_id, &session).await;

        let user = user_id.map(|user_id| User { user_id });
        let mut stream = match self
            .engine
            .generate(&chat.content, user.as_ref(), session_id)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Engine call failed");
                self.send_agent_error(connection_id).await;
                return MessageOutcome::EngineFailed;
            }
        };

        let mut text = String::new();
        let mut chunks = 0;
        let mut metadata = Map::new();
        let mut end = StreamEnd::Completed;

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Engine stream failed");
                    end = StreamEnd::Failed;
                    break;
                }
            };

            let frame = Envelope::chat_response_chunk(session_id, &chunk);
            if !self.registry.send_personal(&frame, connection_id).await {
                end = StreamEnd::Interrupted;
                break;
            }

            text.push_str(&chunk.response_text);
            chunks += 1;
            metadata.insert("agent_type".to_string(), json!(chunk.agent_type));
            metadata.insert("confidence".to_string(), json!(chunk.confidence));
        }
        // Dropping the stream cancels any work the engine has left.
        drop(stream);

        metadata.insert("chunk_count".to_string(), json!(chunks));
        match end {
            StreamEnd::Interrupted => {
                metadata.insert("interrupted".to_string(), Value::Bool(true));
            }
            StreamEnd::Failed => {
                metadata.insert("error".to_string(), Value::Bool(true));
            }
            StreamEnd::Completed => {}
        }

        if !text.is_empty() {
            session.push_assistant_message(text.clone(), metadata.clone());
            self.persist(session_id, &session).await;
        }

        match end {
            StreamEnd::Completed => {
                self.registry
                    .send_personal(
                        &Envelope::chat_response(session_id, &text, &metadata),
                        connection_id,
                    )
                    .await;
                self.registry
                    .send_personal(&Envelope::chat_response_complete(session_id), connection_id)
                    .await;
                debug!(session_id = %session_id, chunks, "Reply delivered");
                MessageOutcome::Completed { chunks }
            }
            StreamEnd::Interrupted => {
                debug!(session_id = %session_id, chunks, "Connection lost mid-reply");
                MessageOutcome::Interrupted { chunks }
            }
            StreamEnd::Failed => {
                self.send_agent_error(connection_id).await;
                MessageOutcome::EngineFailed
            }
        }
    }

    async fn send_agent_error(&self, connection_id: ConnectionId) {
        self.registry
            .send_personal(
                &Envelope::error(ErrorType::AgentError, "Failed to generate a response"),
                connection_id,
            )
            .await;
    }
}
