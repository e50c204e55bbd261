//! `glob`: find files by pattern.

use super::{parse_params, resolve_path};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

const MAX_RESULTS: usize = 1000;
const IGNORED_DIRS: [&str; 2] = ["node_modules", ".git"];

#[derive(Debug, Deserialize)]
struct GlobParams {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

pub async fn run(params: Value) -> String {
    let params: GlobParams = match parse_params("glob", params) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if params.pattern.is_empty() {
        return "Error: pattern is required".to_string();
    }

    let root = params
        .path
        .as_deref()
        .map(resolve_path)
        .unwrap_or_else(|| resolve_path("."));
    let pattern = params.pattern.clone();

    let found = tokio::task::spawn_blocking(move || find(&root, &pattern)).await;
    let files = match found {
        Ok(Ok(files)) => files,
        Ok(Err(e)) => return format!("Error searching files: {}", e),
        Err(e) => return format!("Error searching files: {}", e),
    };

    if files.is_empty() {
        return format!("No files found matching pattern: {}", params.pattern);
    }

    let total = files.len();
    let mut listing: Vec<String> = files
        .iter()
        .take(MAX_RESULTS)
        .map(|p| p.display().to_string())
        .collect();
    if total > MAX_RESULTS {
        listing.push(format!("\n[... {} more files]", total - MAX_RESULTS));
    }

    format!("Found {} file(s):\n{}", total, listing.join("\n"))
}

fn find(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, ::glob::PatternError> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        root.join(pattern).to_string_lossy().into_owned()
    };

    let mut files: Vec<PathBuf> = ::glob::glob(&full)?
        .filter_map(Result::ok)
        .filter(|p| !is_ignored(p))
        .collect();
    files.sort();
    Ok(files)
}

fn is_ignored(path: &Path) -> bool {
    path.components()
        .any(|c| IGNORED_DIRS.iter().any(|d| c.as_os_str() == *d))
}
