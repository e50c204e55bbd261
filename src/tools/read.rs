//! `read`: file contents with line numbers.

use super::{parse_params, resolve_path};
use serde::Deserialize;
use serde_json::Value;
use std::io::ErrorKind;

#[derive(Debug, Deserialize)]
struct ReadParams {
    file_path: String,
    #[serde(default = "default_offset")]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_offset() -> usize {
    1
}

fn default_limit() -> usize {
    2000
}

pub async fn run(params: Value) -> String {
    let params: ReadParams = match parse_params("read", params) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if params.file_path.is_empty() {
        return "Error: file_path is required".to_string();
    }

    let path = resolve_path(&params.file_path);
    if path.is_dir() {
        return format!("Error: Path is a directory, not a file: {}", path.display());
    }

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return format!("Error: File not found: {}", path.display())
        }
        Err(e) => return format!("Error reading file: {}", e),
    };

    number_lines(&content, params.offset, params.limit)
}

fn number_lines(content: &str, offset: usize, limit: usize) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let start = offset.max(1);
    let end = lines.len().min(start + limit.max(1) - 1);
    if start > end {
        return String::new();
    }

    let width = end.to_string().len();
    let numbered: Vec<String> = lines[start - 1..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:>width$}\t{}", start + i, line, width = width))
        .collect();
    let result = numbered.join("\n");

    if lines.len() > end {
        format!("{}\n\n[... {} more lines]", result, lines.len() - end)
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_lines_window() {
        let text = "a\nb\nc\nd";
        assert_eq!(number_lines(text, 2, 2), "2\tb\n3\tc\n\n[... 1 more lines]");
        assert_eq!(number_lines(text, 1, 2000), "1\ta\n2\tb\n3\tc\n4\td");
    }

    #[tokio::test]
    async fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello\nworld").unwrap();

        let out = run(json!({"file_path": path.to_str().unwrap()})).await;
        assert_eq!(out, "1\thello\n2\tworld");
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.txt");
        let out = run(json!({"file_path": path.to_str().unwrap()})).await;
        assert!(out.starts_with("Error: File not found"));
    }

    #[tokio::test]
    async fn test_read_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(json!({"file_path": dir.path().to_str().unwrap()})).await;
        assert!(out.starts_with("Error: Path is a directory"));
    }
}
