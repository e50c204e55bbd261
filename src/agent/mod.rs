//! Conversation orchestrator.
//!
//! Drives one user turn: streams the model's answer, runs the tool calls it
//! asks for one after another, feeds the results back and repeats until the
//! model answers without tool calls.

pub mod conversation;

pub use conversation::Conversation;

use crate::error::ModelError;
use crate::llm::{ChatBackend, ChatRequest, Message, ToolCall};
use crate::tools::{LocalExecutor, ToolExecutor};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Default ceiling on model round-trips in one turn.
pub const DEFAULT_MAX_ROUNDS: usize = 25;

/// Executes a tool call on behalf of a turn, possibly on another machine.
///
/// Never fails: problems come back as result text starting with `Error`.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn execute(&self, tool: &str, params: Value, machine: Option<&str>) -> String;
}

#[async_trait]
impl TurnExecutor for LocalExecutor {
    async fn execute(&self, tool: &str, params: Value, machine: Option<&str>) -> String {
        match machine {
            None | Some("") | Some("local") => ToolExecutor::execute(self, tool, params).await,
            Some(other) => format!(
                "Error: Machine \"{}\" not connected (remote machines need a coordinator)",
                other
            ),
        }
    }
}

/// Progress of a turn, reported as it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A content token from the model.
    Delta(String),
    ToolCall {
        tool: String,
        params: Value,
        machine: Option<String>,
    },
    ToolResult {
        tool: String,
        result: String,
        machine: Option<String>,
    },
    /// The final answer. Always the last event of a successful turn.
    Complete(String),
}

enum TurnState {
    Streaming,
    Executing(Vec<ToolCall>),
    Complete(String),
}

/// One streamed model response.
struct Response {
    content: String,
    tool_calls: Vec<ToolCall>,
}

type PromptSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Runs turns against a model backend and a tool executor.
pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    executor: Arc<dyn TurnExecutor>,
    model: RwLock<String>,
    system_prompt: PromptSource,
    tools: Vec<Value>,
    max_rounds: usize,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        executor: Arc<dyn TurnExecutor>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            executor,
            model: RwLock::new(model.into()),
            system_prompt: Arc::new(String::new),
            tools: Vec::new(),
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    /// Rebuild the system prompt for every model request.
    pub fn with_system_prompt(mut self, source: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.system_prompt = Arc::new(source);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn model(&self) -> String {
        self.model.read().clone()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.write() = model.into();
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        self.backend.list_models().await
    }

    /// Run one user turn to completion and return the final answer.
    ///
    /// `conversation` gains, in order: the user message, then for every
    /// round with tool calls an assistant message followed by one tool
    /// message per call, and finally the assistant answer (when non-empty).
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        input: &str,
        on_event: &mut (dyn FnMut(TurnEvent) + Send),
    ) -> Result<String, ModelError> {
        conversation.push(Message::user(input));

        let mut state = TurnState::Streaming;
        let mut rounds = 0;
        loop {
            state = match state {
                TurnState::Streaming => {
                    rounds += 1;
                    if rounds > self.max_rounds {
                        return Err(ModelError::TooManyRounds(self.max_rounds));
                    }
                    let response = self.stream_response(conversation, on_event).await?;
                    if response.tool_calls.is_empty() {
                        TurnState::Complete(response.content)
                    } else {
                        conversation.push(Message::assistant_with_tools(
                            response.content,
                            response.tool_calls.clone(),
                        ));
                        TurnState::Executing(response.tool_calls)
                    }
                }
                TurnState::Executing(calls) => {
                    debug!(count = calls.len(), "executing tool calls");
                    for call in calls {
                        let result = self.execute_call(&call, on_event).await;
                        conversation.push(Message::tool(call.id, result));
                    }
                    TurnState::Streaming
                }
                TurnState::Complete(content) => {
                    if !content.is_empty() {
                        conversation.push(Message::assistant(content.clone()));
                    }
                    info!(rounds, "turn complete");
                    on_event(TurnEvent::Complete(content.clone()));
                    return Ok(content);
                }
            };
        }
    }

    async fn stream_response(
        &self,
        conversation: &Conversation,
        on_event: &mut (dyn FnMut(TurnEvent) + Send),
    ) -> Result<Response, ModelError> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        let prompt = (self.system_prompt)();
        if !prompt.is_empty() {
            messages.push(Message::system(prompt));
        }
        messages.extend(conversation.messages().iter().cloned());

        let request = ChatRequest {
            model: self.model(),
            messages,
            tools: self.tools.clone(),
        };
        let mut stream = self.backend.chat_stream(request).await?;

        let mut response = Response {
            content: String::new(),
            tool_calls: Vec::new(),
        };
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.content.is_empty() {
                response.content.push_str(&chunk.content);
                on_event(TurnEvent::Delta(chunk.content));
            }
            response.tool_calls.extend(chunk.tool_calls);
            if chunk.done {
                break;
            }
        }
        Ok(response)
    }

    async fn execute_call(
        &self,
        call: &ToolCall,
        on_event: &mut (dyn FnMut(TurnEvent) + Send),
    ) -> String {
        let (params, machine) = split_machine(&call.arguments);
        on_event(TurnEvent::ToolCall {
            tool: call.name.clone(),
            params: params.clone(),
            machine: machine.clone(),
        });

        let result = self
            .executor
            .execute(&call.name, params, machine.as_deref())
            .await;

        on_event(TurnEvent::ToolResult {
            tool: call.name.clone(),
            result: result.clone(),
            machine,
        });
        result
    }
}

/// Separate the routing target from the tool's own arguments.
///
/// Non-object payloads become an empty argument object.
pub fn split_machine(arguments: &Value) -> (Value, Option<String>) {
    let Value::Object(map) = arguments else {
        return (Value::Object(Map::new()), None);
    };
    let mut map = map.clone();
    let machine = map
        .remove("machine")
        .and_then(|v| v.as_str().map(str::to_string))
        .filter(|m| !m.is_empty());
    (Value::Object(map), machine)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::{ChunkStream, ModelChunk, Role};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays canned responses and records every request.
    pub(crate) struct ScriptedBackend {
        responses: Mutex<VecDeque<Vec<ModelChunk>>>,
        pub(crate) requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(responses: Vec<Vec<ModelChunk>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ModelError> {
            self.requests.lock().push(request);
            let chunks = self.responses.lock().pop_front().unwrap_or_default();
            Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
        }

        async fn list_models(&self) -> Result<Vec<String>, ModelError> {
            Ok(vec!["scripted-model".into()])
        }

        async fn health_check(&self) -> Result<(), ModelError> {
            Ok(())
        }
    }

    pub(crate) fn text(content: &str) -> ModelChunk {
        ModelChunk {
            content: content.into(),
            ..Default::default()
        }
    }

    pub(crate) fn calls(calls: Vec<ToolCall>) -> ModelChunk {
        ModelChunk {
            tool_calls: calls,
            done: true,
            ..Default::default()
        }
    }

    pub(crate) fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Records calls and answers with a fixed string per tool.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, Value, Option<String>)>>,
    }

    #[async_trait]
    impl TurnExecutor for RecordingExecutor {
        async fn execute(&self, tool: &str, params: Value, machine: Option<&str>) -> String {
            let index = {
                let mut calls = self.calls.lock();
                calls.push((tool.to_string(), params, machine.map(str::to_string)));
                calls.len()
            };
            format!("result {}", index)
        }
    }

    #[tokio::test]
    async fn test_turn_without_tools() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec![text("Hel"), text("lo")]]));
        let orchestrator = Orchestrator::new(backend.clone(), Arc::new(RecordingExecutor::default()), "m")
            .with_system_prompt(|| "be brief".to_string());

        let mut conv = Conversation::new();
        let mut events = Vec::new();
        let answer = orchestrator
            .run_turn(&mut conv, "hi", &mut |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(answer, "Hello");
        assert_eq!(
            events,
            vec![
                TurnEvent::Delta("Hel".into()),
                TurnEvent::Delta("lo".into()),
                TurnEvent::Complete("Hello".into()),
            ]
        );
        let roles: Vec<Role> = conv.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);

        let requests = backend.requests.lock();
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert_eq!(requests[0].model, "m");
    }

    #[tokio::test]
    async fn test_two_tool_calls_keep_order() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![
                text("Let me look."),
                calls(vec![
                    tool_call("c1", "read", json!({"file_path": "/a"})),
                    tool_call("c2", "bash", json!({"command": "ls"})),
                ]),
            ],
            vec![text("All done.")],
        ]));
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = Orchestrator::new(backend.clone(), executor.clone(), "m");

        let mut conv = Conversation::new();
        let mut events = Vec::new();
        orchestrator
            .run_turn(&mut conv, "inspect", &mut |e| events.push(e))
            .await
            .unwrap();

        let messages = conv.messages();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        assert_eq!(messages[1].content, "Let me look.");
        assert_eq!(messages[1].tool_calls.len(), 2);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[2].content, "result 1");
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(messages[3].content, "result 2");
        assert_eq!(messages[4].content, "All done.");
        assert!(conv.validate().is_ok());

        // The second model call saw both results, in order.
        let requests = backend.requests.lock();
        assert_eq!(requests.len(), 2);
        let tail: Vec<Option<&str>> = requests[1]
            .messages
            .iter()
            .map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(tail, vec![None, None, Some("c1"), Some("c2")]);

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                TurnEvent::Delta(_) => "delta",
                TurnEvent::ToolCall { .. } => "call",
                TurnEvent::ToolResult { .. } => "result",
                TurnEvent::Complete(_) => "complete",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["delta", "call", "result", "call", "result", "delta", "complete"]
        );
    }

    #[tokio::test]
    async fn test_machine_is_stripped_from_arguments() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![calls(vec![tool_call(
                "c1",
                "bash",
                json!({"command": "uname", "machine": "build-box"}),
            )])],
            vec![text("ok")],
        ]));
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = Orchestrator::new(backend, executor.clone(), "m");

        let mut conv = Conversation::new();
        orchestrator
            .run_turn(&mut conv, "where am I", &mut |_| {})
            .await
            .unwrap();

        let recorded = executor.calls.lock();
        assert_eq!(recorded[0].0, "bash");
        assert_eq!(recorded[0].1, json!({"command": "uname"}));
        assert_eq!(recorded[0].2.as_deref(), Some("build-box"));
    }

    #[tokio::test]
    async fn test_round_ceiling() {
        let looping = (0..5)
            .map(|i| vec![calls(vec![tool_call(&format!("c{}", i), "bash", json!({}))])])
            .collect();
        let backend = Arc::new(ScriptedBackend::new(looping));
        let orchestrator = Orchestrator::new(backend, Arc::new(RecordingExecutor::default()), "m")
            .with_max_rounds(2);

        let mut conv = Conversation::new();
        let result = orchestrator.run_turn(&mut conv, "loop", &mut |_| {}).await;
        assert!(matches!(result, Err(ModelError::TooManyRounds(2))));
    }

    #[test]
    fn test_split_machine() {
        let (params, machine) = split_machine(&json!({"command": "ls", "machine": ""}));
        assert_eq!(params, json!({"command": "ls"}));
        assert_eq!(machine, None);

        let (params, machine) = split_machine(&json!("garbage"));
        assert_eq!(params, json!({}));
        assert_eq!(machine, None);
    }

    #[tokio::test]
    async fn test_local_executor_rejects_remote_machine() {
        let executor = LocalExecutor::default();
        let out = TurnExecutor::execute(&executor, "bash", json!({"command": "true"}), Some("ghost")).await;
        assert!(out.starts_with("Error: Machine \"ghost\" not connected"));
    }
}
