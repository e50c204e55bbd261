//! Terminal formatting for the REPLs.
//!
//! Colors are dropped when stdout is not a terminal so piped output stays
//! plain.

use crossterm::style::{Color, Stylize};
use serde_json::Value;
use std::fmt::Display;
use std::sync::OnceLock;

/// Longest tool result echoed to the terminal.
const RESULT_PREVIEW: usize = 500;

fn use_color() -> bool {
    static COLOR: OnceLock<bool> = OnceLock::new();
    *COLOR.get_or_init(|| atty::is(atty::Stream::Stdout) && std::env::var_os("NO_COLOR").is_none())
}

fn paint(text: impl Display, color: Color) -> String {
    if use_color() {
        text.to_string().with(color).to_string()
    } else {
        text.to_string()
    }
}

pub fn error(message: impl Display) -> String {
    paint(format!("✗ {}", message), Color::Red)
}

pub fn success(message: impl Display) -> String {
    paint(format!("✓ {}", message), Color::Green)
}

pub fn info(message: impl Display) -> String {
    paint(format!("ℹ {}", message), Color::Blue)
}

pub fn warning(message: impl Display) -> String {
    paint(format!("⚠ {}", message), Color::Yellow)
}

pub fn dim(message: impl Display) -> String {
    paint(message, Color::DarkGrey)
}

pub fn prompt() -> String {
    paint("> ", Color::Green)
}

pub fn assistant_label() -> String {
    paint("Assistant: ", Color::Blue)
}

pub fn tool_call(tool: &str, params: &Value) -> String {
    let params = serde_json::to_string_pretty(params).unwrap_or_else(|_| params.to_string());
    format!(
        "{}{}",
        paint(format!("⚙ Calling {}", tool), Color::Cyan),
        dim(format!(" with {}", params))
    )
}

pub fn tool_result(result: &str) -> String {
    dim(format!("Result: {}", preview(result)))
}

/// First [`RESULT_PREVIEW`] characters of a tool result.
pub fn preview(result: &str) -> String {
    match result.char_indices().nth(RESULT_PREVIEW) {
        Some((cut, _)) => format!("{}...[truncated]", &result[..cut]),
        None => result.to_string(),
    }
}

pub fn header(title: &str) -> String {
    let width = crossterm::terminal::size()
        .map(|(cols, _)| cols as usize)
        .unwrap_or(80)
        .min(120)
        .max(title.chars().count() + 4);
    let line = "─".repeat(width - 2);
    let padding = " ".repeat(width.saturating_sub(title.chars().count() + 4));
    paint(
        format!("┌{}┐\n│ {}{} │\n└{}┘", line, title, padding, line),
        Color::Cyan,
    )
}

pub fn model_info(model: &str, url: &str) -> String {
    format!(
        "{}{}{}{}",
        dim("Model: "),
        paint(model, Color::Cyan),
        dim(" | Endpoint: "),
        paint(url, Color::Cyan)
    )
}

/// One line per model, marking the active one.
pub fn model_list(models: &[String], current: &str) -> String {
    let mut out = paint("Available models:", Color::Cyan);
    for model in models {
        out.push_str(&format!("\n  - {}", model));
        if model == current {
            out.push_str(&paint(" (current)", Color::Green));
        }
    }
    out
}

pub fn machine_list(machines: &[crate::protocol::MachineInfo]) -> String {
    let mut out = paint("Connected machines:", Color::Cyan);
    for machine in machines {
        out.push_str(&format!(
            "\n  - {} {}",
            machine.name,
            dim(format!("[{}]", machine.capabilities.join(", ")))
        ));
    }
    out
}

pub fn help(remote: bool) -> String {
    let mut commands = vec![
        ("/help", "Show this help message"),
        ("/clear", "Clear conversation history"),
        ("/model <name>", "Switch to a different model"),
        ("/models", "List available models"),
    ];
    if remote {
        commands.push(("/machines", "List connected machines"));
    } else {
        commands.push(("/history", "Show conversation history"));
    }
    commands.push(("/exit", "Exit"));

    let mut out = paint("Commands:", Color::Cyan);
    for (command, description) in commands {
        out.push_str(&format!("\n  {}{}", paint(format!("{:<16}", command), Color::Yellow), description));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(600);
        let short = preview(&long);
        assert!(short.ends_with("...[truncated]"));
        assert_eq!(short.chars().filter(|c| *c == 'é').count(), RESULT_PREVIEW);
        assert_eq!(preview("ok\n"), "ok\n");
    }

    #[test]
    fn test_help_lists_mode_specific_commands() {
        assert!(help(true).contains("/machines"));
        assert!(!help(true).contains("/history"));
        assert!(help(false).contains("/history"));
    }

    #[test]
    fn test_model_list_marks_current() {
        let out = model_list(&["a".into(), "b".into()], "b");
        assert!(out.contains("- a"));
        assert!(out.contains("(current)"));
    }
}
