use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

use crate::config::data_dir;

/// One line of the sync activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub timestamp: String,
    pub event: String,
    pub source_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Append-only JSONL record of what each run did to each pair.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::at(data_dir().join("sync-activity.jsonl"))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, event: &SyncEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Logging never fails a sync; a write error is only traced.
    pub fn record(&self, event: SyncEvent) {
        if let Err(err) = self.append(&event) {
            tracing::warn!(%err, path = %self.path.display(), "could not write activity log");
        }
    }

    pub fn read(&self, source_key: Option<&str>, limit: Option<usize>) -> Vec<SyncEvent> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut events: Vec<SyncEvent> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|e: &SyncEvent| source_key.map_or(true, |k| e.source_key == k))
            .collect();

        if let Some(limit) = limit {
            let len = events.len();
            if len > limit {
                events = events.split_off(len - limit);
            }
        }
        events
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

pub fn new_event(
    event_type: &str,
    source_key: &str,
    target_key: Option<&str>,
    field: Option<&str>,
    message: Option<&str>,
) -> SyncEvent {
    SyncEvent {
        timestamp: chrono::Utc::now().to_rfc3339(),
        event: event_type.to_string(),
        source_key: source_key.to_string(),
        target_key: target_key.map(String::from),
        field: field.map(String::from),
        message: message.map(String::from),
    }
}
