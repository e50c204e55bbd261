//! compendium - a coding assistant that runs tools locally or on remote
//! worker machines.
//!
//! Runs a local REPL by default. `serve` starts a coordinator that clients and
//! worker daemons connect to over WebSocket, `connect` opens a REPL against a
//! coordinator, and `daemon` turns this machine into a worker.

mod agent;
mod client;
mod config;
mod connection;
mod context;
mod daemon;
mod error;
mod history;
mod llm;
mod protocol;
mod server;
mod tools;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use history::HistoryStore;
use llm::ollama::OllamaBackend;
use llm::ChatBackend;
use std::io::Read;
use std::process::Command as ProcessCommand;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "compendium")]
#[command(author, version, about = "A coding assistant with local and remote tool execution")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with tools running on this machine (default)
    Chat {
        /// Override the configured model
        #[arg(short = 'm', long, value_name = "MODEL")]
        model: Option<String>,

        /// Override the model endpoint URL
        #[arg(short = 'u', long, value_name = "URL")]
        url: Option<String>,

        /// Don't load or save conversation history
        #[arg(long)]
        no_history: bool,
    },
    /// Run a coordinator that clients and worker daemons connect to
    Serve {
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        #[arg(short = 'p', long, value_name = "PORT")]
        port: Option<u16>,

        /// Shared secret; generated when neither given nor configured
        #[arg(short = 't', long, value_name = "TOKEN")]
        token: Option<String>,

        /// Seconds to wait for a worker to answer a tool request
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        #[arg(short = 'm', long, value_name = "MODEL")]
        model: Option<String>,
    },
    /// Open a REPL against a running coordinator
    Connect {
        /// Coordinator address, e.g. ws://host:3000
        url: String,

        #[arg(short = 't', long, value_name = "TOKEN", env = "COMPENDIUM_TOKEN")]
        token: Option<String>,
    },
    /// Run tools for a coordinator as a named worker machine
    Daemon {
        /// Coordinator address, e.g. ws://host:3000
        url: String,

        #[arg(short = 't', long, value_name = "TOKEN", env = "COMPENDIUM_TOKEN")]
        token: Option<String>,

        /// Machine name the model uses to address this worker
        #[arg(short = 'n', long, value_name = "NAME")]
        name: String,

        /// Comma-separated tools this worker will run
        #[arg(short = 'c', long, value_name = "TOOLS", default_value = "read,write,edit,bash,glob,grep")]
        capabilities: String,
    },
    /// Open configuration file in $EDITOR
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Serve {
            host,
            port,
            token,
            timeout,
            model,
        }) => handle_serve(host, port, token, timeout, model).await,
        Some(Commands::Connect { url, token }) => handle_connect(url, token).await,
        Some(Commands::Daemon {
            url,
            token,
            name,
            capabilities,
        }) => handle_daemon(url, token, name, capabilities).await,
        Some(Commands::Config) => handle_config(),
        Some(Commands::Chat {
            model,
            url,
            no_history,
        }) => handle_chat(model, url, no_history).await,
        None => handle_chat(None, None, false).await,
    };

    if let Err(e) = result {
        eprintln!("{}", client::display::error(format!("{:#}", e)));
        std::process::exit(1);
    }
}

/// Log to stderr; `RUST_LOG` overrides the default level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("compendium={},reqwest=warn", level))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn handle_chat(model: Option<String>, url: Option<String>, no_history: bool) -> Result<()> {
    init_logging("warn");

    let mut config = Config::load().context("Failed to load configuration")?;
    let persist = model.is_none();
    if let Some(model) = model {
        config.model.name = model;
    }
    if let Some(url) = url {
        config.model.url = url;
    }

    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaBackend::new(config.model.url.clone()));
    let mut repl = if persist {
        client::local::LocalRepl::from_config(&config, backend)
    } else {
        client::local::LocalRepl::new(backend, config.model.name.clone(), config.model.url.clone())
    };

    // Piped input runs a single turn without the prompt or history.
    if !atty::is(atty::Stream::Stdin) {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read stdin")?;
        let input = input.trim();
        if input.is_empty() {
            return Ok(());
        }
        return repl.one_shot(input).await;
    }

    repl.check_backend().await?;
    if config.history.enabled && !no_history {
        repl = repl.with_history(HistoryStore::new(Config::history_dir()?)).await;
    }
    repl.run().await
}

async fn handle_serve(
    host: Option<String>,
    port: Option<u16>,
    token: Option<String>,
    timeout: Option<u64>,
    model: Option<String>,
) -> Result<()> {
    init_logging("info");

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(timeout) = timeout {
        config.server.request_timeout_secs = timeout;
    }
    if let Some(model) = model {
        config.model.name = model;
    }
    let token = token
        .or_else(|| config.server.token.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(server::auth::generate_token);

    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaBackend::new(config.model.url.clone()));
    if let Err(e) = backend.health_check().await {
        warn!(backend = backend.name(), url = %config.model.url, error = %e, "model endpoint not reachable");
    }

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {}", address))?;

    println!("{}", client::display::header("Compendium Server"));
    println!("{}", client::display::model_info(&config.model.name, &config.model.url));
    println!("{}", client::display::success(format!("Listening on ws://{}", address)));
    println!("{}", client::display::info(format!("Auth token: {}", token)));
    println!(
        "{}",
        client::display::dim(format!(
            "Connect with: compendium connect ws://<host>:{} --token {}",
            config.server.port, token
        ))
    );

    let coordinator = server::Coordinator::from_config(&config, backend, token);
    coordinator
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
}

async fn handle_connect(url: String, token: Option<String>) -> Result<()> {
    init_logging("warn");
    client::remote::run(url, token).await
}

async fn handle_daemon(url: String, token: Option<String>, name: String, capabilities: String) -> Result<()> {
    init_logging("info");

    let capabilities = tools::parse_capabilities(&capabilities)
        .map_err(|e| anyhow::anyhow!("Invalid capabilities: {}", e))?;
    let name = name.trim().to_string();
    if name.is_empty() {
        anyhow::bail!("Machine name must not be empty");
    }

    let daemon = daemon::WorkerDaemon::new(url, token, name, capabilities);
    info!(
        name = %daemon.name(),
        capabilities = %daemon.capabilities().join(", "),
        "starting worker"
    );
    daemon
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

/// Handle the config command.
fn handle_config() -> Result<()> {
    let config_path = Config::config_path()?;

    // Create default config if it doesn't exist
    if !config_path.exists() {
        Config::default().save()?;
        println!("Created default config at {}", config_path.display());
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = ProcessCommand::new(&editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        eprintln!("Editor exited with non-zero status");
    }

    Ok(())
}
