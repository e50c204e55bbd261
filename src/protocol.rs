//! Wire protocol between clients, the coordinator and worker daemons.
//!
//! Every message is one JSON object per WebSocket text frame, tagged by its
//! `type` field. The `id` field correlates a request with its responses.
//! Parsers return `None` for anything that is not a known, complete shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Message sent from an interactive client to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A user turn.
    Chat { id: String, content: String },
    /// A slash command such as `clear` or `model`.
    Command {
        id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Vec<String>>,
    },
}

/// Message sent from the coordinator to a client (and, for `system` and
/// `error`, to workers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A streamed content token for chat `id`.
    Stream { id: String, delta: String },
    /// The model asked for a tool. `params` carries the target `machine`.
    ToolCall {
        id: String,
        tool: String,
        params: Value,
    },
    ToolResult {
        id: String,
        tool: String,
        result: String,
    },
    /// The turn for chat `id` finished. Always sent after its last `stream`.
    Complete {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    #[serde(rename = "error")]
    Failure { id: String, message: String },
    System {
        event: SystemEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// Events carried by [`ServerMessage::System`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    /// Connection established, registration confirmed, or machine list
    /// changed.
    Connected,
    ModelChanged,
    HistoryCleared,
    ModelsList,
}

/// Message sent from a worker daemon to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Announce a machine name and the tools this worker will run.
    Register {
        name: String,
        capabilities: Vec<String>,
    },
    /// Successful output for execute request `id`.
    #[serde(rename = "result")]
    Output { id: String, output: String },
    /// Failure for execute request `id`.
    DaemonError { id: String, message: String },
}

/// Message sent from the coordinator to a worker daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Execute {
        id: String,
        tool: String,
        params: Value,
    },
}

/// A named execution target and the tools it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub name: String,
    pub capabilities: Vec<String>,
}

/// Parse a client→coordinator frame.
pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    serde_json::from_str(text).ok()
}

/// Parse a coordinator→client frame.
pub fn parse_server_message(text: &str) -> Option<ServerMessage> {
    serde_json::from_str(text).ok()
}

/// Parse a worker→coordinator frame.
pub fn parse_worker_message(text: &str) -> Option<WorkerMessage> {
    serde_json::from_str(text).ok()
}

/// Parse a coordinator→worker frame.
pub fn parse_worker_command(text: &str) -> Option<WorkerCommand> {
    serde_json::from_str(text).ok()
}

/// Serialize a message into a text frame.
pub fn encode<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize protocol message");
        String::new()
    })
}

impl ServerMessage {
    /// A `system{event: connected}` message carrying the machine list.
    pub fn machines(machines: &[MachineInfo]) -> Self {
        ServerMessage::System {
            event: SystemEvent::Connected,
            data: Some(serde_json::json!({ "machines": machines })),
        }
    }

    /// Reply for a frame that matched no known shape.
    pub fn invalid_format() -> Self {
        ServerMessage::Failure {
            id: "unknown".to_string(),
            message: "Invalid message format".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_chat() {
        let msg = parse_client_message(r#"{"type":"chat","id":"c1","content":"hi"}"#);
        assert_eq!(
            msg,
            Some(ClientMessage::Chat {
                id: "c1".into(),
                content: "hi".into()
            })
        );
    }

    #[test]
    fn test_parse_command_without_args() {
        let msg = parse_client_message(r#"{"type":"command","id":"c2","command":"clear"}"#);
        assert_eq!(
            msg,
            Some(ClientMessage::Command {
                id: "c2".into(),
                command: "clear".into(),
                args: None
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(parse_client_message(r#"{"type":"dance","id":"x"}"#).is_none());
        assert!(parse_worker_message(r#"{"type":"chat","id":"x","content":"y"}"#).is_none());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(parse_client_message(r#"{"type":"chat","id":"c1"}"#).is_none());
        assert!(parse_worker_message(r#"{"type":"register","name":"box"}"#).is_none());
        assert!(parse_worker_command(r#"{"type":"execute","id":"1","tool":"bash"}"#).is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(parse_client_message("not json").is_none());
        assert!(parse_worker_message("").is_none());
        assert!(parse_server_message("[1,2]").is_none());
    }

    #[test]
    fn test_worker_message_tags() {
        let msg = parse_worker_message(r#"{"type":"result","id":"r1","output":"ok\n"}"#);
        assert_eq!(
            msg,
            Some(WorkerMessage::Output {
                id: "r1".into(),
                output: "ok\n".into()
            })
        );

        let msg = parse_worker_message(r#"{"type":"daemon_error","id":"r1","message":"boom"}"#);
        assert!(matches!(msg, Some(WorkerMessage::DaemonError { .. })));
    }

    #[test]
    fn test_error_message_encodes_as_error_type() {
        let text = encode(&ServerMessage::invalid_format());
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["id"], "unknown");
    }

    #[test]
    fn test_complete_omits_missing_content() {
        let text = encode(&ServerMessage::Complete {
            id: "c1".into(),
            content: None,
        });
        assert_eq!(text, r#"{"type":"complete","id":"c1"}"#);
    }

    #[test]
    fn test_machines_message() {
        let machines = vec![MachineInfo {
            name: "local".into(),
            capabilities: vec!["bash".into()],
        }];
        let value: Value = serde_json::from_str(&encode(&ServerMessage::machines(&machines))).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(value["event"], "connected");
        assert_eq!(value["data"]["machines"][0]["name"], "local");
    }

    #[test]
    fn test_execute_encoding() {
        let cmd = WorkerCommand::Execute {
            id: "abc".into(),
            tool: "bash".into(),
            params: json!({"command": "echo ok"}),
        };
        let value: Value = serde_json::from_str(&encode(&cmd)).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["params"]["command"], "echo ok");
    }
}
