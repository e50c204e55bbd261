//! Ollama backend implementation.
//!
//! Uses `/api/chat` with `stream: true`; the response body is newline
//! delimited JSON, one chunk per line, with tool calls on the final chunks.

use super::{ChatBackend, ChatRequest, ChunkStream, Message, ModelChunk, Role, ToolCall};
use crate::error::ModelError;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Ollama backend for local LLM inference.
pub struct OllamaBackend {
    host: String,
    client: Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend.
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into().trim_end_matches('/').to_string();
        Self {
            host,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ModelError> {
        let url = format!("{}/api/chat", self.host);
        let body = OllamaChatRequest {
            model: &request.model,
            messages: request.messages.iter().map(OllamaMessage::from).collect(),
            tools: &request.tools,
            stream: true,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }

        let (tx, rx) = mpsc::unbounded();
        let mut bytes = response.bytes_stream();
        tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.unbounded_send(Err(ModelError::Http(e)));
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    if let Some(parsed) = parse_line(&line) {
                        let done = matches!(parsed, Ok(ModelChunk { done: true, .. }));
                        if tx.unbounded_send(parsed).is_err() || done {
                            return;
                        }
                    }
                }
            }
            if let Some(parsed) = lines.finish().as_deref().and_then(parse_line) {
                let _ = tx.unbounded_send(parsed);
            }
        });

        Ok(rx.boxed())
    }

    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/api/tags", self.host);
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }

        let tags: OllamaTags = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn health_check(&self) -> Result<(), ModelError> {
        self.list_models().await.map(|_| ())
    }
}

/// Splits a byte stream into lines, decoding each line only once it is
/// complete so multi-byte characters cut across reads stay intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left after the last newline.
    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

/// Parse one NDJSON line. Blank and malformed lines are skipped.
fn parse_line(line: &str) -> Option<Result<ModelChunk, ModelError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let chunk: OllamaChunk = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "skipping malformed stream line");
            return None;
        }
    };

    if let Some(error) = chunk.error {
        return Some(Err(ModelError::Stream(error)));
    }

    let message = chunk.message.unwrap_or_default();
    let tool_calls: Vec<ToolCall> = message
        .tool_calls
        .into_iter()
        .map(OllamaToolCall::into_tool_call)
        .collect();
    if !tool_calls.is_empty() {
        debug!(count = tool_calls.len(), "model requested tool calls");
    }

    Some(Ok(ModelChunk {
        content: message.content,
        tool_calls,
        done: chunk.done,
    }))
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    tools: &'a [Value],
    stream: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for OllamaMessage {
    fn from(message: &Message) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| OllamaToolCall {
                    id: Some(call.id.clone()),
                    kind: Some("function".to_string()),
                    function: OllamaFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    function: OllamaFunction,
}

impl OllamaToolCall {
    fn into_tool_call(self) -> ToolCall {
        // Some models send arguments as a JSON-encoded string.
        let arguments = match self.function.arguments {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| Value::Object(Default::default())),
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        ToolCall {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
            name: self.function.name,
            arguments,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}
