//! `write`: create or overwrite a file.

use super::{parse_params, resolve_path};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct WriteParams {
    file_path: String,
    content: String,
}

pub async fn run(params: Value) -> String {
    let params: WriteParams = match parse_params("write", params) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if params.file_path.is_empty() {
        return "Error: file_path is required".to_string();
    }

    let path = resolve_path(&params.file_path);
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return format!("Error writing file: {}", e);
        }
    }

    if let Err(e) = tokio::fs::write(&path, &params.content).await {
        return format!("Error writing file: {}", e);
    }

    format!(
        "File written successfully: {} ({} lines, {} bytes)",
        path.display(),
        params.content.split('\n').count(),
        params.content.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.txt");

        let out = run(json!({"file_path": path.to_str().unwrap(), "content": "x\ny"})).await;
        assert!(out.starts_with("File written successfully"));
        assert!(out.ends_with("(2 lines, 3 bytes)"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x\ny");
    }

    #[tokio::test]
    async fn test_write_requires_content() {
        let out = run(json!({"file_path": "/tmp/whatever"})).await;
        assert!(out.starts_with("Error: invalid parameters for write"));
    }
}
