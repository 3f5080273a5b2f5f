//! Chat endpoint abstraction.
//!
//! The orchestrator talks to backends through the [`ChatClient`] trait so
//! tests can substitute a scripted client. A streaming call returns a
//! [`ChatEventStream`]: zero or more content fragments followed by a
//! terminal success or failure. Dropping the stream ends the subscription.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Generation options forwarded to the chat endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
}

/// A request to one backend's chat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    /// Model identifier understood by the endpoint.
    pub model: String,
    /// Conversation messages, in order.
    pub messages: Vec<ChatMessage>,
    /// Optional generation options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
}

/// Events emitted by a streaming chat call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Incremental text output fragment.
    Chunk(String),
    /// Terminal success event, with the generated token count when the
    /// backend reports one.
    Done { token_count: Option<u32> },
}

/// Errors from a chat client.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Chat API error: {0}")]
    Api(String),
    #[error("Server unreachable at {0}")]
    ServerUnreachable(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Stream of chat events: fragments, then one terminal event or error.
pub type ChatEventStream = BoxStream<'static, Result<ChatEvent, ChatError>>;

/// A chat endpoint shared by all backends of a comparison.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Probes whether the endpoint is reachable at all.
    ///
    /// Checked once per session start; a negative answer fails the whole
    /// fan-out without issuing per-backend calls.
    async fn is_reachable(&self) -> bool;

    /// Starts a streaming chat call and returns its event stream.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatEventStream, ChatError>;
}
