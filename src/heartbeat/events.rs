//! Append-only heartbeat telemetry (`state/heartbeat-events.jsonl`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    Ran,
    Skipped,
    HeartbeatOk,
    Error,
}

/// Skip reasons.
pub const OUTSIDE_ACTIVE_HOURS: &str = "outside_active_hours";
pub const NO_WORK: &str = "no_work";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub timestamp: DateTime<Utc>,
    pub outcome: HeartbeatOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tasks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HeartbeatEvent {
    pub fn new(outcome: HeartbeatOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            reason: None,
            active_tasks: None,
            input_tokens: None,
            output_tokens: None,
            duration_ms: None,
            delivered: false,
            error: None,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::new(HeartbeatOutcome::Skipped)
        }
    }
}

pub struct HeartbeatLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HeartbeatLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join("state").join("heartbeat-events.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single JSON line.
    pub async fn append(&self, event: &HeartbeatEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serializing heartbeat event")?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }

    /// The newest `n` events, oldest first. Unparsable lines are skipped.
    pub async fn recent(&self, n: usize) -> Result<Vec<HeartbeatEvent>> {
        let _guard = self.lock.lock().await;
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let mut events: Vec<HeartbeatEvent> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(ev) => Some(ev),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed heartbeat event line");
                    None
                }
            })
            .collect();
        let skip = events.len().saturating_sub(n);
        events.drain(..skip);
        Ok(events)
    }
}
