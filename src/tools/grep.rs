//! `grep`: search file contents with a regular expression.

use super::{parse_params, resolve_path, truncate_output, MAX_OUTPUT_LENGTH};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use walkdir::WalkDir;

const EXCLUDED_DIRS: [&str; 3] = ["node_modules", ".git", "dist"];

#[derive(Debug, Deserialize)]
struct GrepParams {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    include: Option<String>,
}

pub async fn run(params: Value) -> String {
    let params: GrepParams = match parse_params("grep", params) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if params.pattern.is_empty() {
        return "Error: pattern is required".to_string();
    }

    let regex = match Regex::new(&params.pattern) {
        Ok(r) => r,
        Err(e) => return format!("Error: invalid regex: {}", e),
    };
    let include = match params.include.as_deref().map(glob::Pattern::new).transpose() {
        Ok(p) => p,
        Err(e) => return format!("Error: invalid include pattern: {}", e),
    };
    let root = params
        .path
        .as_deref()
        .map(resolve_path)
        .unwrap_or_else(|| resolve_path("."));

    let searched =
        tokio::task::spawn_blocking(move || search(&root, &regex, include.as_ref())).await;
    let (count, output) = match searched {
        Ok(found) => found,
        Err(e) => return format!("Error searching: {}", e),
    };

    if count == 0 {
        return format!("No matches found for pattern: {}", params.pattern);
    }
    format!("Found {} match(es):\n{}", count, truncate_output(output))
}

fn search(root: &Path, regex: &Regex, include: Option<&glob::Pattern>) -> (usize, String) {
    let mut count = 0;
    let mut output = String::new();

    let entries = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && EXCLUDED_DIRS
                    .iter()
                    .any(|d| e.file_name() == *d))
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file());

    for entry in entries {
        if let Some(pattern) = include {
            if !pattern.matches(&entry.file_name().to_string_lossy()) {
                continue;
            }
        }
        // Binary and unreadable files are skipped.
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (number, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                count += 1;
                if output.len() <= MAX_OUTPUT_LENGTH {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&format!("{}:{}:{}", entry.path().display(), number + 1, line));
                }
            }
        }
    }

    (count, output)
}
