//! System prompt and tool schemas advertised to the model.

use crate::context::Environment;
use crate::protocol::MachineInfo;
use serde_json::{json, Value};

const SYSTEM_PROMPT: &str = r#"You are Compendium, a helpful AI coding assistant. You help users with software engineering tasks including:
- Reading and understanding code
- Writing and editing files
- Running shell commands
- Searching codebases
- Debugging and fixing issues

You have access to the following tools to interact with the user's filesystem and execute commands:

1. **read** - Read the contents of a file
2. **write** - Create or overwrite a file
3. **edit** - Find and replace text in a file
4. **bash** - Execute shell commands
5. **glob** - Find files matching a pattern
6. **grep** - Search file contents with regex

When using tools:
- Always read a file before editing it
- Use absolute paths when possible
- Be careful with destructive operations
- Explain what you're doing before executing commands

Be concise and helpful. Focus on solving the user's problem efficiently."#;

/// Build the system prompt for the current environment and machine list.
///
/// The machine section is only added when at least one worker is connected.
pub fn system_prompt(env: &Environment, machines: &[MachineInfo]) -> String {
    let mut prompt = format!(
        "{}\n\nContext:\nOS: {}\nShell: {}\nCWD: {}",
        SYSTEM_PROMPT,
        env.os,
        env.shell,
        env.cwd.display()
    );

    if machines.len() > 1 {
        let list: Vec<String> = machines
            .iter()
            .map(|m| format!("  - {}: {}", m.name, m.capabilities.join(", ")))
            .collect();
        prompt.push_str(&format!(
            "\n\nConnected machines:\n{}\n\nYou can execute tools on remote machines by adding a \"machine\" parameter to tool calls. If not specified, tools execute locally on the server.",
            list.join("\n")
        ));
    }

    prompt
}

/// Function schemas for the built-in tools.
///
/// With `remote` set every schema gains an optional `machine` parameter.
pub fn tool_schemas(remote: bool) -> Vec<Value> {
    let mut schemas = vec![
        schema(
            "read",
            "Read the contents of a file. Returns the file content with line numbers.",
            json!({
                "file_path": {"type": "string", "description": "The absolute path to the file to read"},
                "offset": {"type": "number", "description": "The line number to start reading from (1-indexed)"},
                "limit": {"type": "number", "description": "Maximum number of lines to read"}
            }),
            &["file_path"],
        ),
        schema(
            "write",
            "Create or overwrite a file with the given content.",
            json!({
                "file_path": {"type": "string", "description": "The absolute path to the file to write"},
                "content": {"type": "string", "description": "The content to write to the file"}
            }),
            &["file_path", "content"],
        ),
        schema(
            "edit",
            "Find and replace text in a file. The old_string must be unique in the file.",
            json!({
                "file_path": {"type": "string", "description": "The absolute path to the file to edit"},
                "old_string": {"type": "string", "description": "The text to find and replace"},
                "new_string": {"type": "string", "description": "The replacement text"},
                "replace_all": {"type": "boolean", "description": "Whether to replace all occurrences (default: false)"}
            }),
            &["file_path", "old_string", "new_string"],
        ),
        schema(
            "bash",
            "Execute a shell command and return the output.",
            json!({
                "command": {"type": "string", "description": "The shell command to execute"},
                "timeout": {"type": "number", "description": "Timeout in milliseconds (default: 30000)"}
            }),
            &["command"],
        ),
        schema(
            "glob",
            "Find files matching a glob pattern.",
            json!({
                "pattern": {"type": "string", "description": "The glob pattern to match (e.g., \"**/*.rs\")"},
                "path": {"type": "string", "description": "The directory to search in (default: current directory)"}
            }),
            &["pattern"],
        ),
        schema(
            "grep",
            "Search file contents using a regular expression.",
            json!({
                "pattern": {"type": "string", "description": "The regex pattern to search for"},
                "path": {"type": "string", "description": "The file or directory to search in"},
                "include": {"type": "string", "description": "Glob pattern to filter files (e.g., \"*.rs\")"}
            }),
            &["pattern"],
        ),
    ];

    if remote {
        for schema in &mut schemas {
            schema["function"]["parameters"]["properties"]["machine"] = json!({
                "type": "string",
                "description": "Target machine to execute on. Use \"local\" or omit for local execution, or specify a connected machine name."
            });
        }
    }

    schemas
}

fn schema(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        }
    })
}
