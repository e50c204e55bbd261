//! `bash`: run a shell command.

use super::{parse_params, truncate_output};
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct BashParams {
    command: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

pub async fn run(params: Value) -> String {
    let params: BashParams = match parse_params("bash", params) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if params.command.trim().is_empty() {
        return "Error: command is required".to_string();
    }

    let child = Command::new("sh")
        .arg("-c")
        .arg(&params.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(c) => c,
        Err(e) => return format!("Error: failed to execute command: {}", e),
    };

    let output = match tokio::time::timeout(
        Duration::from_millis(params.timeout),
        child.wait_with_output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return format!("Error: failed to execute command: {}", e),
        Err(_) => return format!("Command timed out after {}ms", params.timeout),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("stderr:\n");
        text.push_str(&stderr);
    }

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        text = format!("Exit code: {}\n{}", code, text);
    }

    if text.is_empty() {
        return "Command completed with no output".to_string();
    }
    truncate_output(text)
}
