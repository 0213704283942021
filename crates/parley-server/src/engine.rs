//! Conversation engine seam.
//!
//! The engine produces chat replies as a finite stream of chunks. The
//! server consumes each stream exactly once and drops it early when the
//! requesting connection goes away, which cancels any remaining work.

use std::time::Instant;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Error from the conversation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be reached.
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// The engine failed while producing a response.
    #[error("Engine failed: {0}")]
    Failed(String),
}

/// One piece of an engine response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub response_text: String,
    pub agent_type: String,
    pub confidence: f64,
    /// Seconds spent producing this chunk.
    pub processing_time: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ResponseChunk {
    /// A text chunk with neutral metadata.
    pub fn text(agent_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            response_text: text.into(),
            agent_type: agent_type.into(),
            confidence: 1.0,
            processing_time: 0.0,
            metadata: Map::new(),
        }
    }
}

/// The end user a message is generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
}

/// Stream of response chunks.
pub type ResponseStream = BoxStream<'static, Result<ResponseChunk, EngineError>>;

/// Produces replies to chat messages.
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Start generating a reply to `message` within `session_id`.
    async fn generate(
        &self,
        message: &str,
        user: Option<&User>,
        session_id: &str,
    ) -> Result<ResponseStream, EngineError>;
}

/// Engine that echoes the message back one word per chunk.
///
/// Used when no real engine is wired in.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine;

#[async_trait]
impl ConversationEngine for EchoEngine {
    async fn generate(
        &self,
        message: &str,
        _user: Option<&User>,
        _session_id: &str,
    ) -> Result<ResponseStream, EngineError> {
        let words: Vec<String> = message.split_whitespace().map(str::to_string).collect();
        let last = words.len().saturating_sub(1);

        let stream = async_stream::stream! {
            for (i, word) in words.into_iter().enumerate() {
                let started = Instant::now();
                let text = if i == last { word } else { format!("{word} ") };
                let mut chunk = ResponseChunk::text("echo", text);
                chunk.processing_time = started.elapsed().as_secs_f64();
                yield Ok::<_, EngineError>(chunk);
            }
        };
        Ok(Box::pin(stream))
    }
}
