//! Worker daemon: runs tools on behalf of a coordinator.
//!
//! Connects out to the coordinator, registers a machine name with its
//! capabilities, then answers `execute` frames until stopped. Registration is
//! repeated after every reconnect. Only a rejection of the very first
//! registration is fatal; later rejections are retried because the
//! coordinator may still hold the previous session under the same name.

use crate::connection::{ConnectionConfig, ConnectionEvent, ReconnectingConnection};
use crate::protocol::{
    encode, parse_server_message, parse_worker_command, ServerMessage, SystemEvent, WorkerCommand,
    WorkerMessage,
};
use crate::tools::{is_error_output, LocalExecutor, ToolExecutor};
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Id the coordinator uses when it answers a registration with an error.
const REGISTER_ID: &str = "register";

/// The coordinator's answer to a `register` frame.
#[derive(Debug, PartialEq, Eq)]
enum Registration {
    Accepted,
    Rejected(String),
}

pub struct WorkerDaemon {
    name: String,
    executor: Arc<LocalExecutor>,
    config: ConnectionConfig,
}

impl WorkerDaemon {
    pub fn new(url: impl Into<String>, token: Option<String>, name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self::with_connection(ConnectionConfig::worker(url, token), name, capabilities)
    }

    pub fn with_connection(config: ConnectionConfig, name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            executor: Arc::new(LocalExecutor::restricted(capabilities)),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &[String] {
        self.executor.capabilities()
    }

    fn registration(&self) -> WorkerMessage {
        WorkerMessage::Register {
            name: self.name.clone(),
            capabilities: self.capabilities().to_vec(),
        }
    }

    /// Serve execute requests until `shutdown` resolves.
    ///
    /// Fails when the first connection cannot be made, when the coordinator
    /// rejects the first registration, or when reconnection gives up.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (connection, mut events) = ReconnectingConnection::new(self.config.clone())?;
        info!(url = %connection.url(), name = %self.name, "connecting to coordinator");
        connection
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {}", connection.url()))?;

        // Execution tasks hand their replies back here so only this loop
        // touches the connection.
        let (replies_tx, mut replies) = mpsc::unbounded_channel::<WorkerMessage>();
        tokio::pin!(shutdown);

        let mut registered_once = false;
        let mut retry_at: Option<Instant> = None;

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    break Ok(());
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    info!(name = %self.name, "retrying registration");
                    if let Err(e) = connection.send(encode(&self.registration())) {
                        warn!(error = %e, "failed to send registration");
                    }
                }
                Some(reply) = replies.recv() => {
                    if let Err(e) = connection.send(encode(&reply)) {
                        warn!(error = %e, "dropping reply, coordinator not connected");
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break Ok(()) };
                    match event {
                        ConnectionEvent::Connected => {
                            info!(
                                name = %self.name,
                                capabilities = %self.capabilities().join(", "),
                                "connected, registering"
                            );
                            retry_at = None;
                            if let Err(e) = connection.send(encode(&self.registration())) {
                                warn!(error = %e, "failed to send registration");
                            }
                        }
                        ConnectionEvent::Message(text) => match self.handle_frame(&text, &replies_tx) {
                            Some(Registration::Accepted) => {
                                info!(name = %self.name, "registered");
                                registered_once = true;
                            }
                            Some(Registration::Rejected(message)) if !registered_once => {
                                error!(name = %self.name, %message, "registration rejected");
                                break Err(anyhow!("registration as \"{}\" rejected: {}", self.name, message));
                            }
                            Some(Registration::Rejected(message)) => {
                                warn!(name = %self.name, %message, "re-registration rejected, will retry");
                                retry_at = Some(Instant::now() + self.config.interval);
                            }
                            None => {}
                        },
                        ConnectionEvent::Disconnected => warn!("disconnected from coordinator"),
                        ConnectionEvent::Reconnecting(attempt) => {
                            info!(attempt, interval = ?self.config.interval, "reconnecting");
                        }
                        ConnectionEvent::ReconnectFailed => {
                            break Err(anyhow!("gave up reconnecting to {}", connection.url()));
                        }
                        ConnectionEvent::Error(e) => warn!(error = %e, "connection error"),
                    }
                }
            }
        };

        connection.disconnect();
        outcome
    }

    /// Start execute requests; report registration answers to the caller.
    fn handle_frame(&self, text: &str, replies: &mpsc::UnboundedSender<WorkerMessage>) -> Option<Registration> {
        if let Some(WorkerCommand::Execute { id, tool, params }) = parse_worker_command(text) {
            let executor = self.executor.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                info!(request_id = %id, %tool, "executing");
                let output = executor.execute(&tool, params).await;
                let reply = if is_error_output(&output) {
                    warn!(request_id = %id, %tool, "tool failed");
                    WorkerMessage::DaemonError { id, message: output }
                } else {
                    info!(request_id = %id, %tool, bytes = output.len(), "completed");
                    WorkerMessage::Output { id, output }
                };
                let _ = replies.send(reply);
            });
            return None;
        }

        match parse_server_message(text) {
            Some(ServerMessage::System {
                event: SystemEvent::Connected,
                data: Some(data),
            }) if data["registered"].as_bool() == Some(true) => return Some(Registration::Accepted),
            Some(ServerMessage::Failure { id, message }) if id == REGISTER_ID => {
                return Some(Registration::Rejected(message));
            }
            Some(ServerMessage::Failure { id, message }) => {
                warn!(request_id = %id, %message, "coordinator reported an error");
            }
            Some(other) => debug!(message = ?other, "ignoring frame"),
            None => warn!(frame = %text, "dropping malformed frame"),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    fn fast(url: String) -> ConnectionConfig {
        ConnectionConfig {
            url,
            token: Some("secret".into()),
            reconnect: true,
            interval: Duration::from_millis(20),
            max_attempts: Some(2),
        }
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn test_registers_and_executes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let register = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "system", "event": "connected", "data": {"registered": true, "name": "build-box"}})).await;
            ws.send(Message::Text("not json".to_string().into())).await.unwrap();

            send_json(&mut ws, json!({"type": "execute", "id": "r1", "tool": "bash", "params": {"command": "echo ok"}})).await;
            let result = next_json(&mut ws).await;

            send_json(&mut ws, json!({"type": "execute", "id": "r2", "tool": "write", "params": {"path": "/tmp/x", "content": "x"}})).await;
            let refused = next_json(&mut ws).await;
            (register, result, refused, ws)
        });

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let daemon = WorkerDaemon::with_connection(fast(format!("ws://{}", addr)), "build-box", vec!["bash".into()]);
        let worker = tokio::spawn(daemon.run(async {
            let _ = stop_rx.await;
        }));

        // Keep the server side open until the worker has stopped.
        let (register, result, refused, _ws) = server.await.unwrap();
        assert_eq!(
            register,
            json!({"type": "register", "name": "build-box", "capabilities": ["bash"]})
        );
        assert_eq!(result, json!({"type": "result", "id": "r1", "output": "ok\n"}));
        assert_eq!(refused["type"], "daemon_error");
        assert_eq!(refused["id"], "r2");
        assert!(refused["message"].as_str().unwrap().starts_with("Error"));

        stop_tx.send(()).unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_registration_stops_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "error", "id": "register", "message": "Machine name \"build-box\" is already registered"})).await;
            let _ = ws.next().await;
        });

        let daemon = WorkerDaemon::with_connection(fast(format!("ws://{}", addr)), "build-box", vec!["bash".into()]);
        let err = tokio::time::timeout(Duration::from_secs(5), daemon.run(std::future::pending()))
            .await
            .expect("worker did not stop")
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_rejection_after_reconnect_is_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // First session registers and then drops.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "system", "event": "connected", "data": {"registered": true, "name": "build-box"}})).await;
            drop(ws);

            // The coordinator still holds the old name when the worker comes back.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "error", "id": "register", "message": "Machine name \"build-box\" is already registered"})).await;

            let retried = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "system", "event": "connected", "data": {"registered": true, "name": "build-box"}})).await;
            send_json(&mut ws, json!({"type": "execute", "id": "r1", "tool": "bash", "params": {"command": "echo ok"}})).await;
            let result = next_json(&mut ws).await;
            (retried, result, ws)
        });

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let daemon = WorkerDaemon::with_connection(fast(format!("ws://{}", addr)), "build-box", vec!["bash".into()]);
        let worker = tokio::spawn(daemon.run(async {
            let _ = stop_rx.await;
        }));

        let (retried, result, _ws) = server.await.unwrap();
        assert_eq!(retried["type"], "register");
        assert_eq!(result, json!({"type": "result", "id": "r1", "output": "ok\n"}));
        assert!(!worker.is_finished());

        stop_tx.send(()).unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let daemon = WorkerDaemon::with_connection(fast(format!("ws://{}", addr)), "w", vec!["read".into()]);
        assert!(daemon.run(std::future::pending()).await.is_err());
    }
}
