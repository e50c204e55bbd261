//! The coordinator: accepts client and worker sockets, runs chat turns and
//! routes their tool calls.

use super::auth;
use super::registry::SessionRegistry;
use super::router::ToolRouter;
use crate::agent::{Conversation, Orchestrator, TurnEvent, TurnExecutor};
use crate::config::Config;
use crate::context::Environment;
use crate::llm::{prompts, ChatBackend};
use crate::protocol::{
    encode, parse_client_message, parse_worker_message, ClientMessage, ServerMessage, SystemEvent,
    WorkerMessage,
};
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type SharedConversation = Arc<tokio::sync::Mutex<Conversation>>;

pub struct Coordinator {
    registry: Arc<SessionRegistry>,
    router: Arc<ToolRouter>,
    orchestrator: Orchestrator,
    token: String,
    /// One conversation per client session.
    conversations: Mutex<HashMap<String, SharedConversation>>,
    persist_model: bool,
}

impl Coordinator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        model: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
        env: Environment,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(ToolRouter::new(registry.clone(), request_timeout));

        let executor: Arc<dyn TurnExecutor> = router.clone();
        let prompt_registry = registry.clone();
        let orchestrator = Orchestrator::new(backend, executor, model)
            .with_tools(prompts::tool_schemas(true))
            .with_system_prompt(move || prompts::system_prompt(&env, &prompt_registry.list_machines()));

        Self {
            registry,
            router,
            orchestrator,
            token: token.into(),
            conversations: Mutex::new(HashMap::new()),
            persist_model: false,
        }
    }

    /// Write model changes made by clients back to the config file.
    pub fn persist_model_changes(mut self) -> Self {
        self.persist_model = true;
        self
    }

    /// Build a coordinator from the loaded configuration.
    pub fn from_config(config: &Config, backend: Arc<dyn ChatBackend>, token: String) -> Arc<Self> {
        let coordinator = Self::new(
            backend,
            config.model.name.clone(),
            token,
            config.server.request_timeout(),
            crate::context::gather(),
        );
        Arc::new(coordinator.persist_model_changes())
    }

    pub fn app(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "coordinator listening");
        }
        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await
            .context("Coordinator server failed")
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let session_id = self.registry.open_session(tx);
        self.conversations.lock().insert(session_id.clone(), SharedConversation::default());
        info!(session_id, "connection opened");

        // Single writer per socket keeps frames in send order.
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        self.send(
            &session_id,
            &ServerMessage::System {
                event: SystemEvent::Connected,
                data: Some(json!({
                    "sessionId": session_id,
                    "model": self.orchestrator.model(),
                    "machines": self.registry.list_machines(),
                })),
            },
        );

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_frame(&session_id, text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(session_id, error = %e, "socket error");
                    break;
                }
            }
        }

        info!(session_id, "connection closed");
        if let Some(machine) = self.registry.close_session(&session_id) {
            let failed = self.router.fail_session(&session_id);
            if failed > 0 {
                warn!(machine, failed, "failed requests of disconnected worker");
            }
        }
        self.conversations.lock().remove(&session_id);
        let _ = writer.await;
    }

    fn handle_frame(self: &Arc<Self>, session_id: &str, text: &str) {
        if let Some(message) = parse_worker_message(text) {
            self.handle_worker_message(session_id, message);
        } else if let Some(message) = parse_client_message(text) {
            self.handle_client_message(session_id, message);
        } else {
            debug!(session_id, "invalid frame");
            self.send(session_id, &ServerMessage::invalid_format());
        }
    }

    fn handle_worker_message(&self, session_id: &str, message: WorkerMessage) {
        match message {
            WorkerMessage::Register { name, capabilities } => {
                match self.registry.register(session_id, &name, capabilities) {
                    Ok(displaced) => {
                        if let Some(old) = displaced {
                            let failed = self.router.fail_session(&old);
                            if failed > 0 {
                                warn!(machine = %name, failed, "failed requests of replaced worker");
                            }
                        }
                        self.send(
                            session_id,
                            &ServerMessage::System {
                                event: SystemEvent::Connected,
                                data: Some(json!({ "registered": true, "name": name.trim() })),
                            },
                        );
                    }
                    Err(e) => {
                        warn!(session_id, machine = %name, error = %e, "registration rejected");
                        self.send(
                            session_id,
                            &ServerMessage::Failure {
                                id: "register".to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
            }
            WorkerMessage::Output { id, output } => {
                self.router.handle_result(&id, output);
            }
            WorkerMessage::DaemonError { id, message } => {
                self.router.handle_error(&id, message);
            }
        }
    }

    fn handle_client_message(self: &Arc<Self>, session_id: &str, message: ClientMessage) {
        let this = self.clone();
        let session_id = session_id.to_string();
        match message {
            ClientMessage::Chat { id, content } => {
                tokio::spawn(async move { this.run_chat(session_id, id, content).await });
            }
            ClientMessage::Command { id, command, args } => {
                tokio::spawn(async move {
                    let reply = this
                        .run_command(&session_id, &id, &command, args.unwrap_or_default())
                        .await;
                    this.send(&session_id, &reply);
                });
            }
        }
    }

    async fn run_chat(&self, session_id: String, id: String, content: String) {
        let Some(conversation) = self.conversation(&session_id) else {
            debug!(session_id, chat_id = %id, "chat for closed session dropped");
            return;
        };
        // Turns of one session wait for each other here.
        let mut conversation = conversation.lock().await;

        let registry = self.registry.clone();
        let (sid, cid) = (session_id.clone(), id.clone());
        let mut on_event = move |event: TurnEvent| {
            registry.send_to(&sid, encode(&turn_message(&cid, event)));
        };

        debug!(session_id, chat_id = %id, "turn started");
        if let Err(e) = self
            .orchestrator
            .run_turn(&mut conversation, &content, &mut on_event)
            .await
        {
            error!(session_id, chat_id = %id, error = %e, "turn failed");
            self.send(
                &session_id,
                &ServerMessage::Failure {
                    id,
                    message: e.to_string(),
                },
            );
        }
    }

    async fn run_command(&self, session_id: &str, id: &str, command: &str, args: Vec<String>) -> ServerMessage {
        match command {
            "clear" => {
                if let Some(conversation) = self.conversation(session_id) {
                    conversation.lock().await.clear();
                }
                ServerMessage::System {
                    event: SystemEvent::HistoryCleared,
                    data: None,
                }
            }
            "model" => {
                if !args.is_empty() {
                    let model = args.join(" ");
                    self.orchestrator.set_model(&model);
                    info!(session_id, model, "model changed");
                    if self.persist_model {
                        if let Err(e) = Config::update_model(&model) {
                            warn!(error = %e, "failed to persist model");
                        }
                    }
                }
                ServerMessage::System {
                    event: SystemEvent::ModelChanged,
                    data: Some(json!({ "model": self.orchestrator.model() })),
                }
            }
            "models" => match self.orchestrator.list_models().await {
                Ok(models) => ServerMessage::System {
                    event: SystemEvent::ModelsList,
                    data: Some(json!({ "models": models, "current": self.orchestrator.model() })),
                },
                Err(e) => ServerMessage::Failure {
                    id: id.to_string(),
                    message: e.to_string(),
                },
            },
            "machines" => ServerMessage::machines(&self.registry.list_machines()),
            other => ServerMessage::Failure {
                id: id.to_string(),
                message: format!("Unknown command: {}", other),
            },
        }
    }

    /// Conversation of an open session; `None` once the socket has closed.
    fn conversation(&self, session_id: &str) -> Option<SharedConversation> {
        self.conversations.lock().get(session_id).cloned()
    }

    fn send(&self, session_id: &str, message: &ServerMessage) {
        self.registry.send_to(session_id, encode(message));
    }
}

/// Wire form of a turn event for chat `id`.
fn turn_message(id: &str, event: TurnEvent) -> ServerMessage {
    let id = id.to_string();
    match event {
        TurnEvent::Delta(delta) => ServerMessage::Stream { id, delta },
        TurnEvent::ToolCall {
            tool,
            mut params,
            machine,
        } => {
            if let (Some(machine), Value::Object(map)) = (machine, &mut params) {
                map.insert("machine".to_string(), Value::String(machine));
            }
            ServerMessage::ToolCall { id, tool, params }
        }
        TurnEvent::ToolResult { tool, result, .. } => ServerMessage::ToolResult { id, tool, result },
        TurnEvent::Complete(content) => ServerMessage::Complete {
            id,
            content: Some(content),
        },
    }
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if !auth::validate(&coordinator.token, &headers, query.token.as_deref()) {
        warn!("rejected connection with bad token");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    ws.on_upgrade(move |socket| coordinator.handle_socket(socket))
}

async fn health_handler(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "machines": coordinator.registry.list_machines(),
    }))
}
