//! Cron data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::{DeliveryMode, DeliveryTarget};

/// A statically configured, cron-driven schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    pub name: String,
    /// Cron expression, 5-field (`min hour dom month dow`) or the 6/7-field form.
    pub cron: String,
    pub prompt: String,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool { true }

impl ScheduleDefinition {
    pub fn target(&self) -> DeliveryTarget {
        DeliveryTarget {
            mode: self.delivery,
            channel: self.channel.clone(),
            chat_id: self.chat_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire once at `run_at`, then disappear.
    Once { run_at: DateTime<Utc> },
    /// Fire every `interval_seconds`, next at `next_run`.
    Interval {
        interval_seconds: u64,
        next_run: DateTime<Utc>,
    },
}

/// A timer the agent created for itself at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicScheduleTask {
    pub id: String,
    #[serde(flatten)]
    pub kind: ScheduleKind,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryMode,
}

impl DynamicScheduleTask {
    pub fn is_once(&self) -> bool {
        matches!(self.kind, ScheduleKind::Once { .. })
    }

    /// The next instant this task is due.
    pub fn next_fire(&self) -> DateTime<Utc> {
        match &self.kind {
            ScheduleKind::Once { run_at } => *run_at,
            ScheduleKind::Interval { next_run, .. } => *next_run,
        }
    }

    pub fn target(&self) -> DeliveryTarget {
        DeliveryTarget {
            mode: self.delivery,
            channel: self.channel.clone(),
            chat_id: self.chat_id.clone(),
        }
    }

    /// Session key this task reports back to, `channel:chat_id`.
    pub fn session_key(&self) -> Option<String> {
        match (&self.channel, &self.chat_id) {
            (Some(ch), Some(chat)) => Some(format!("{ch}:{chat}")),
            _ => None,
        }
    }

    /// One-line description for listings.
    pub fn describe(&self) -> String {
        let preview: String = self.prompt.chars().take(60).collect();
        match &self.kind {
            ScheduleKind::Once { run_at } => {
                format!("[{}] once at {} - {}", self.id, run_at.to_rfc3339(), preview)
            }
            ScheduleKind::Interval { interval_seconds, next_run } => format!(
                "[{}] every {}s, next {} - {}",
                self.id,
                interval_seconds,
                next_run.to_rfc3339(),
                preview
            ),
        }
    }
}

/// Lifecycle of one live timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Registered,
    Firing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerSource {
    Static,
    Once,
    Interval,
}

/// Snapshot of a live timer, as reported by `ScheduleEngine::list_timers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStatus {
    /// Schedule name for static timers, task id for dynamic ones.
    pub key: String,
    pub source: TimerSource,
    pub state: TimerState,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub fire_count: u64,
}

impl TimerStatus {
    pub fn new(key: impl Into<String>, source: TimerSource, next_fire: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.into(),
            source,
            state: TimerState::Registered,
            next_fire,
            last_fired_at: None,
            last_error: None,
            fire_count: 0,
        }
    }
}
