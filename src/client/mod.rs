//! Interactive front ends.
//!
//! - `local`: a REPL that runs the model loop and tools in this process
//! - `remote`: a REPL that talks to a coordinator over WebSocket
//! - `display`: shared terminal formatting

pub mod display;
pub mod local;
pub mod remote;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

/// A slash command typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Exit,
    Clear,
    /// Show the model, or switch to the named one.
    Model(Option<String>),
    Models,
    Machines,
    History,
    Unknown(String),
}

impl ReplCommand {
    /// Parse a line starting with `/`. Other input is not a command.
    pub fn parse(input: &str) -> Option<Self> {
        let rest = input.trim().strip_prefix('/')?;
        let mut words = rest.split_whitespace();
        let command = words.next().unwrap_or_default().to_lowercase();
        let args: Vec<&str> = words.collect();

        Some(match command.as_str() {
            "help" => Self::Help,
            "exit" | "quit" => Self::Exit,
            "clear" => Self::Clear,
            "model" if args.is_empty() => Self::Model(None),
            "model" => Self::Model(Some(args.join(" "))),
            "models" => Self::Models,
            "machines" => Self::Machines,
            "history" => Self::History,
            _ => Self::Unknown(command),
        })
    }
}

pub(crate) fn stdin_lines() -> Lines<BufReader<Stdin>> {
    BufReader::new(tokio::io::stdin()).lines()
}

/// Print without a newline and flush so streamed tokens show up at once.
pub(crate) fn print_inline(text: &str) {
    use std::io::Write;
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}
