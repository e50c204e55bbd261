//! Remote REPL: chats with a coordinator over a reconnecting WebSocket.

use super::{display, print_inline, stdin_lines, ReplCommand};
use crate::connection::{ConnectionConfig, ConnectionEvent, ReconnectingConnection};
use crate::protocol::{
    encode, parse_server_message, ClientMessage, MachineInfo, ServerMessage, SystemEvent,
};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// What the REPL knows about the server, updated from incoming frames.
#[derive(Debug, Default)]
struct View {
    session_id: Option<String>,
    model: String,
    /// Chat id whose `complete` we are waiting for.
    pending: Option<String>,
}

impl View {
    /// Apply one server frame and return the text to print.
    fn apply(&mut self, message: ServerMessage) -> String {
        match message {
            ServerMessage::Stream { delta, .. } => delta,
            ServerMessage::ToolCall { tool, params, .. } => {
                format!("\n{}\n", display::tool_call(&tool, &params))
            }
            ServerMessage::ToolResult { result, .. } => {
                format!("{}\n{}", display::tool_result(&result), display::assistant_label())
            }
            ServerMessage::Complete { id, .. } => {
                self.settle(&id);
                "\n\n".to_string()
            }
            ServerMessage::Failure { id, message } => {
                self.settle(&id);
                format!("\n{}\n", display::error(message))
            }
            ServerMessage::System { event, data } => self.apply_system(event, data.unwrap_or_default()),
        }
    }

    fn apply_system(&mut self, event: SystemEvent, data: Value) -> String {
        match event {
            SystemEvent::Connected => {
                if let Some(id) = data["sessionId"].as_str() {
                    self.session_id = Some(id.to_string());
                }
                if let Some(model) = data["model"].as_str() {
                    self.model = model.to_string();
                }
                match serde_json::from_value::<Vec<MachineInfo>>(data["machines"].clone()) {
                    Ok(machines) => format!("{}\n", display::machine_list(&machines)),
                    Err(_) => String::new(),
                }
            }
            SystemEvent::ModelChanged => {
                if let Some(model) = data["model"].as_str() {
                    self.model = model.to_string();
                }
                format!("{}\n", display::success(format!("Model: {}", self.model)))
            }
            SystemEvent::HistoryCleared => format!("{}\n", display::success("Conversation cleared")),
            SystemEvent::ModelsList => {
                let models: Vec<String> = serde_json::from_value(data["models"].clone()).unwrap_or_default();
                let current = data["current"].as_str().unwrap_or(&self.model).to_string();
                format!("{}\n", display::model_list(&models, &current))
            }
        }
    }

    fn settle(&mut self, id: &str) {
        if self.pending.as_deref() == Some(id) {
            self.pending = None;
        }
    }
}

/// Connect to `url` and run the REPL until `/exit`, end of input, or the
/// connection is lost for good.
pub async fn run(url: String, token: Option<String>) -> Result<()> {
    let (connection, mut events) = ReconnectingConnection::new(ConnectionConfig::client(url, token))?;
    connection.connect().await.context("Failed to connect")?;

    println!("{}", display::header("Compendium - Remote Client"));
    println!("{}", display::success(format!("Connected to {}", connection.url())));
    println!("{}\n", display::dim("Type /help for commands, /exit to quit"));

    let mut view = View::default();
    let mut lines = stdin_lines();
    let mut connected_once = false;
    let mut show_prompt = true;

    loop {
        if show_prompt && view.pending.is_none() {
            print_inline(&display::prompt());
            show_prompt = false;
        }

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::Connected => {
                        if connected_once {
                            println!("{}", display::success("Reconnected"));
                            show_prompt = true;
                        }
                        connected_once = true;
                    }
                    ConnectionEvent::Message(text) => match parse_server_message(&text) {
                        Some(message) => {
                            let waiting = view.pending.is_some();
                            print_inline(&view.apply(message));
                            if waiting && view.pending.is_none() {
                                show_prompt = true;
                            }
                        }
                        None => debug!(frame = %text, "ignoring unknown frame"),
                    },
                    ConnectionEvent::Disconnected => {
                        println!("\n{}", display::warning("Disconnected from server"));
                        debug!(session_id = ?view.session_id, "session lost");
                        view.pending = None;
                    }
                    ConnectionEvent::Reconnecting(attempt) => {
                        println!("{}", display::warning(format!("Reconnecting... (attempt {})", attempt)));
                    }
                    ConnectionEvent::ReconnectFailed => {
                        println!("{}", display::error("Failed to reconnect to server"));
                        bail!("connection to {} lost", connection.url());
                    }
                    ConnectionEvent::Error(e) => {
                        println!("{}", display::error(format!("Connection error: {}", e)));
                    }
                }
            }
            line = lines.next_line(), if view.pending.is_none() => {
                let Some(line) = line? else { break };
                show_prompt = true;
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                match ReplCommand::parse(input) {
                    Some(ReplCommand::Exit) => break,
                    Some(command) => send_command(&connection, command),
                    None => {
                        let id = Uuid::new_v4().to_string();
                        let chat = ClientMessage::Chat { id: id.clone(), content: input.to_string() };
                        match connection.send(encode(&chat)) {
                            Ok(()) => {
                                print_inline(&display::assistant_label());
                                view.pending = Some(id);
                            }
                            Err(e) => println!("{}", display::error(e)),
                        }
                    }
                }
            }
        }
    }

    println!("{}", display::dim("Goodbye!"));
    connection.disconnect();
    Ok(())
}

fn send_command(connection: &ReconnectingConnection, command: ReplCommand) {
    let (name, args) = match command {
        ReplCommand::Help => {
            println!("{}\n", display::help(true));
            return;
        }
        ReplCommand::Clear => ("clear", None),
        ReplCommand::Model(model) => ("model", model.map(|m| vec![m])),
        ReplCommand::Models => ("models", None),
        ReplCommand::Machines => ("machines", None),
        ReplCommand::History => {
            println!("{}", display::info("History is kept by the server in remote mode"));
            return;
        }
        ReplCommand::Unknown(command) => {
            println!("{}", display::error(format!("Unknown command: /{}", command)));
            return;
        }
        ReplCommand::Exit => return,
    };

    let message = ClientMessage::Command {
        id: Uuid::new_v4().to_string(),
        command: name.to_string(),
        args,
    };
    if let Err(e) = connection.send(encode(&message)) {
        println!("{}", display::error(e));
    }
}
