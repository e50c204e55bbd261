//! Local REPL: model loop and tools run in this process.

use super::{display, print_inline, stdin_lines, ReplCommand};
use crate::agent::{Conversation, Orchestrator, TurnEvent};
use crate::config::Config;
use crate::history::HistoryStore;
use crate::llm::{prompts, ChatBackend, Role};
use crate::tools::LocalExecutor;
use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::warn;

pub struct LocalRepl {
    orchestrator: Orchestrator,
    conversation: Conversation,
    history: Option<HistoryStore>,
    session: String,
    endpoint: String,
    persist_model: bool,
}

impl LocalRepl {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let env = crate::context::gather();
        let orchestrator = Orchestrator::new(backend, Arc::new(LocalExecutor::default()), model)
            .with_tools(prompts::tool_schemas(false))
            .with_system_prompt(move || prompts::system_prompt(&env, &[]));
        Self {
            orchestrator,
            conversation: Conversation::new(),
            history: None,
            session: HistoryStore::today(),
            endpoint: endpoint.into(),
            persist_model: false,
        }
    }

    pub fn from_config(config: &Config, backend: Arc<dyn ChatBackend>) -> Self {
        let mut repl = Self::new(backend, config.model.name.clone(), config.model.url.clone());
        repl.persist_model = true;
        repl
    }

    /// Keep the conversation in `store`, resuming today's session.
    pub async fn with_history(mut self, store: HistoryStore) -> Self {
        let messages = store.load(&self.session).await;
        if !messages.is_empty() {
            println!("{}", display::info(format!("Loaded {} messages from history", messages.len())));
        }
        self.conversation = Conversation::from_messages(messages);
        self.history = Some(store);
        self
    }

    /// Fail early when the model endpoint is down.
    pub async fn check_backend(&self) -> Result<()> {
        let model = self.orchestrator.model();
        match self.orchestrator.list_models().await {
            Ok(models) => {
                if !models.iter().any(|m| m == &model) {
                    println!("{}", display::warning(format!("Model {} not found", model)));
                    println!("{}", display::info(format!("Pull it with: ollama pull {}", model)));
                }
                Ok(())
            }
            Err(e) => {
                println!("{}", display::error(format!("Cannot connect to model endpoint at {}", self.endpoint)));
                println!("{}", display::info("Make sure Ollama is running: ollama serve"));
                bail!(e)
            }
        }
    }

    pub async fn run(mut self) -> Result<()> {
        println!("{}", display::header("Compendium - Local AI Coding Assistant"));
        println!("{}", display::model_info(&self.orchestrator.model(), &self.endpoint));
        println!("{}\n", display::dim("Type /help for commands, /exit to quit"));

        let mut lines = stdin_lines();
        loop {
            print_inline(&display::prompt());
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let input = line.trim();
            if input.is_empty() {
                continue;
            }

            match ReplCommand::parse(input) {
                Some(ReplCommand::Exit) => break,
                Some(command) => self.handle_command(command).await,
                None => self.chat(input).await,
            }
        }

        println!("{}", display::dim("Goodbye!"));
        Ok(())
    }

    /// Run a single turn for piped input and print the answer.
    pub async fn one_shot(mut self, input: &str) -> Result<()> {
        let mut on_event = |event: TurnEvent| match event {
            TurnEvent::ToolCall { tool, params, .. } => eprintln!("{}", display::tool_call(&tool, &params)),
            TurnEvent::ToolResult { result, .. } => eprintln!("{}", display::tool_result(&result)),
            TurnEvent::Delta(_) => {}
            TurnEvent::Complete(content) => println!("{}", content),
        };
        self.orchestrator
            .run_turn(&mut self.conversation, input, &mut on_event)
            .await?;
        Ok(())
    }

    async fn chat(&mut self, input: &str) {
        print_inline(&display::assistant_label());
        let mut on_event = |event: TurnEvent| match event {
            TurnEvent::Delta(delta) => print_inline(&delta),
            TurnEvent::ToolCall { tool, params, .. } => {
                println!("\n{}", display::tool_call(&tool, &params));
            }
            TurnEvent::ToolResult { result, .. } => {
                println!("{}", display::tool_result(&result));
                print_inline(&display::assistant_label());
            }
            TurnEvent::Complete(_) => println!("\n"),
        };

        if let Err(e) = self
            .orchestrator
            .run_turn(&mut self.conversation, input, &mut on_event)
            .await
        {
            println!("\n{}", display::error(format!("Error: {}", e)));
        }
        self.save_history().await;
    }

    async fn handle_command(&mut self, command: ReplCommand) {
        match command {
            ReplCommand::Help => println!("{}\n", display::help(false)),
            ReplCommand::Clear => {
                self.conversation.clear();
                if let Some(store) = &self.history {
                    if let Err(e) = store.clear(&self.session).await {
                        warn!(error = %e, "failed to clear history file");
                    }
                }
                println!("{}", display::success("Conversation cleared"));
            }
            ReplCommand::Model(None) => {
                println!("{}", display::info(format!("Current model: {}", self.orchestrator.model())));
            }
            ReplCommand::Model(Some(model)) => {
                self.orchestrator.set_model(&model);
                if self.persist_model {
                    if let Err(e) = Config::update_model(&model) {
                        warn!(error = %e, "failed to persist model");
                    }
                }
                println!("{}", display::success(format!("Switched to model: {}", model)));
            }
            ReplCommand::Models => match self.orchestrator.list_models().await {
                Ok(models) => println!("{}", display::model_list(&models, &self.orchestrator.model())),
                Err(e) => println!("{}", display::error(format!("Failed to list models: {}", e))),
            },
            ReplCommand::History => {
                println!("{}", history_listing(&self.conversation));
                if let Some(store) = &self.history {
                    let sessions = store.list().await;
                    if !sessions.is_empty() {
                        println!("{}", display::dim(format!("Saved sessions: {}", sessions.join(", "))));
                    }
                }
            }
            ReplCommand::Machines => {
                println!("{}", display::info("Only the local machine is available outside server mode"));
            }
            ReplCommand::Unknown(command) => {
                println!("{}", display::error(format!("Unknown command: /{}", command)));
            }
            ReplCommand::Exit => {}
        }
    }

    async fn save_history(&self) {
        if let Some(store) = &self.history {
            if let Err(e) = store.save(&self.session, self.conversation.messages()).await {
                warn!(error = %e, "failed to save history");
            }
        }
    }
}

/// Numbered user and assistant messages, each cut to 100 characters.
fn history_listing(conversation: &Conversation) -> String {
    let entries: Vec<String> = conversation
        .messages()
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
        .enumerate()
        .map(|(i, m)| {
            let who = if m.role == Role::User { "You" } else { "Assistant" };
            let content = match m.content.char_indices().nth(100) {
                Some((cut, _)) => format!("{}...", &m.content[..cut]),
                None => m.content.clone(),
            };
            format!("{}. {}: {}", i + 1, who, content)
        })
        .collect();

    if entries.is_empty() {
        display::info("No conversation history")
    } else {
        format!("Conversation history:\n{}", entries.join("\n"))
    }
}
