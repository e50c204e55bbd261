//! Built-in tools and the executor boundary.
//!
//! Tools never fail across the boundary: any problem is reported as text
//! starting with `Error`, which callers forward to the model like any other
//! result.

pub mod bash;
pub mod edit;
pub mod glob;
pub mod grep;
pub mod read;
pub mod write;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Every tool this build knows how to run, in the order advertised to models.
pub const TOOL_NAMES: [&str; 6] = ["read", "write", "edit", "bash", "glob", "grep"];

/// Cap on the size of tool output handed back to the model.
pub const MAX_OUTPUT_LENGTH: usize = 50_000;

/// Runs a named tool with JSON parameters and returns its textual result.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool: &str, params: Value) -> String;
}

/// Executes tools in this process, optionally limited to a capability list.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    capabilities: Vec<String>,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self {
            capabilities: TOOL_NAMES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl LocalExecutor {
    /// An executor that only runs the listed tools.
    pub fn restricted(capabilities: Vec<String>) -> Self {
        Self { capabilities }
    }

    pub fn can_execute(&self, tool: &str) -> bool {
        self.capabilities.iter().any(|c| c == tool)
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

#[async_trait]
impl ToolExecutor for LocalExecutor {
    async fn execute(&self, tool: &str, params: Value) -> String {
        if !self.can_execute(tool) {
            return format!("Error: Tool \"{}\" is not in the allowed capabilities", tool);
        }
        execute_tool(tool, params).await
    }
}

/// Dispatch to a built-in tool by name.
pub async fn execute_tool(name: &str, params: Value) -> String {
    match name {
        "read" => read::run(params).await,
        "write" => write::run(params).await,
        "edit" => edit::run(params).await,
        "bash" => bash::run(params).await,
        "glob" => glob::run(params).await,
        "grep" => grep::run(params).await,
        _ => format!("Error: Unknown tool: {}", name),
    }
}

/// Whether a tool result reports a failure.
pub fn is_error_output(output: &str) -> bool {
    output.starts_with("Error:") || output.starts_with("Error executing")
}

/// Check a comma-separated capability list against the known tools.
pub fn parse_capabilities(list: &str) -> Result<Vec<String>, String> {
    let mut capabilities = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !TOOL_NAMES.contains(&name) {
            return Err(format!(
                "unknown tool \"{}\" (available: {})",
                name,
                TOOL_NAMES.join(", ")
            ));
        }
        if !capabilities.iter().any(|c| c == name) {
            capabilities.push(name.to_string());
        }
    }
    if capabilities.is_empty() {
        return Err("at least one capability is required".to_string());
    }
    Ok(capabilities)
}

pub(crate) fn parse_params<T: DeserializeOwned>(tool: &str, params: Value) -> Result<T, String> {
    serde_json::from_value(params)
        .map_err(|e| format!("Error: invalid parameters for {}: {}", tool, e))
}

/// Resolve a possibly relative path against the working directory.
pub(crate) fn resolve_path(path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

pub(crate) fn truncate_output(mut output: String) -> String {
    if output.len() > MAX_OUTPUT_LENGTH {
        let mut end = MAX_OUTPUT_LENGTH;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
        output.push_str("\n...[output truncated]");
    }
    output
}
