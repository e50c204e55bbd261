//! Conversation history for local mode.
//!
//! One JSON file per day under the config directory, holding the full
//! message list of that day's session.

use crate::llm::Message;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct HistoryEntry {
    timestamp: DateTime<Utc>,
    messages: Vec<Message>,
}

/// Reads and writes day files in one directory.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Session id for today, `YYYY-MM-DD`.
    pub fn today() -> String {
        Local::now().format("%Y-%m-%d").to_string()
    }

    fn path(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session))
    }

    /// Messages saved for `session`. Missing or unreadable files yield an
    /// empty history.
    pub async fn load(&self, session: &str) -> Vec<Message> {
        let path = self.path(session);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<HistoryEntry>(&contents) {
            Ok(entry) => {
                debug!(path = %path.display(), count = entry.messages.len(), "loaded history");
                entry.messages
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable history file");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, session: &str, messages: &[Message]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create history directory: {}", self.dir.display()))?;
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            messages: messages.to_vec(),
        };
        let path = self.path(session);
        let contents = serde_json::to_string_pretty(&entry)?;
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write history file: {}", path.display()))
    }

    pub async fn clear(&self, session: &str) -> Result<()> {
        let path = self.path(session);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove history file: {}", path.display())),
        }
    }

    /// Saved sessions, newest first.
    pub async fn list(&self) -> Vec<String> {
        let mut sessions = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return sessions;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if let Some(session) = session_name(&path) {
                sessions.push(session);
            }
        }
        sessions.sort_unstable_by(|a, b| b.cmp(a));
        sessions
    }
}

fn session_name(path: &Path) -> Option<String> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}
