//! Chat model backends.
//!
//! The orchestrator talks to a model through [`ChatBackend`]: one streamed
//! request per model round-trip, yielding content tokens and, at the end of a
//! response, the tool calls the model wants made.

pub mod ollama;
pub mod prompts;

use crate::error::ModelError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tools requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The [`ToolCall::id`] a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A model-requested tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON object of arguments, possibly including a `machine` target.
    pub arguments: Value,
}

/// One model round-trip.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Function schemas advertised to the model.
    pub tools: Vec<Value>,
}

/// A piece of a streamed response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelChunk {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub done: bool,
}

pub type ChunkStream = BoxStream<'static, Result<ModelChunk, ModelError>>;

/// A chat-completion endpoint that supports tool calls.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &'static str;

    /// Start a streamed completion.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ModelError>;

    /// Models available at the endpoint.
    async fn list_models(&self) -> Result<Vec<String>, ModelError>;

    /// Check if the backend is reachable.
    async fn health_check(&self) -> Result<(), ModelError>;
}
