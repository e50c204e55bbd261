//! `edit`: find-and-replace inside a file.

use super::{parse_params, resolve_path};
use serde::Deserialize;
use serde_json::Value;
use std::io::ErrorKind;

#[derive(Debug, Deserialize)]
struct EditParams {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

pub async fn run(params: Value) -> String {
    let params: EditParams = match parse_params("edit", params) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if params.file_path.is_empty() {
        return "Error: file_path is required".to_string();
    }
    if params.old_string.is_empty() {
        return "Error: old_string is required".to_string();
    }
    if params.old_string == params.new_string {
        return "Error: old_string and new_string must be different".to_string();
    }

    let path = resolve_path(&params.file_path);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return format!("Error: File not found: {}", path.display())
        }
        Err(e) => return format!("Error editing file: {}", e),
    };

    let occurrences = content.matches(params.old_string.as_str()).count();
    if occurrences == 0 {
        return format!("Error: old_string not found in file: {}", path.display());
    }
    if occurrences > 1 && !params.replace_all {
        return format!(
            "Error: old_string found {} times. Use replace_all: true to replace all, or provide a more specific string.",
            occurrences
        );
    }

    let (updated, replacements) = if params.replace_all {
        (content.replace(&params.old_string, &params.new_string), occurrences)
    } else {
        (content.replacen(&params.old_string, &params.new_string, 1), 1)
    };

    if let Err(e) = tokio::fs::write(&path, updated).await {
        return format!("Error editing file: {}", e);
    }

    format!(
        "Successfully replaced {} occurrence(s) in {}",
        replacements,
        path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_edit_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.rs");
        std::fs::write(&path, "let x = 1;\nlet y = 2;\n").unwrap();

        let out = run(json!({
            "file_path": path.to_str().unwrap(),
            "old_string": "x = 1",
            "new_string": "x = 10",
        }))
        .await;
        assert!(out.starts_with("Successfully replaced 1 occurrence(s)"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "let x = 10;\nlet y = 2;\n");
    }

    #[tokio::test]
    async fn test_edit_ambiguous_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.txt");
        std::fs::write(&path, "a a a").unwrap();

        let args = json!({"file_path": path.to_str().unwrap(), "old_string": "a", "new_string": "b"});
        let out = run(args.clone()).await;
        assert!(out.starts_with("Error: old_string found 3 times"));

        let mut all = args;
        all["replace_all"] = json!(true);
        let out = run(all).await;
        assert!(out.starts_with("Successfully replaced 3 occurrence(s)"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b b b");
    }

    #[tokio::test]
    async fn test_edit_identical_strings() {
        let out = run(json!({"file_path": "/x", "old_string": "a", "new_string": "a"})).await;
        assert_eq!(out, "Error: old_string and new_string must be different");
    }
}
