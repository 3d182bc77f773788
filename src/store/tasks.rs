//! Tracked agent tasks (`state/tasks.json`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Document, JsonStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    AwaitingCheck,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Statuses that count as outstanding work for the heartbeat.
    pub const ACTIVE: [TaskStatus; 3] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::AwaitingCheck,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingCheck => "awaiting_check",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "awaiting_check" => Ok(TaskStatus::AwaitingCheck),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => anyhow::bail!(
                "unknown task status '{other}' (expected pending, in_progress, awaiting_check, completed, failed or cancelled)"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl FromStr for TaskPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => anyhow::bail!("unknown task priority '{other}' (expected low, normal, high or urgent)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub check_count: u32,
    /// Minutes between heartbeat checks while `awaiting_check`.
    #[serde(default)]
    pub check_interval_minutes: Option<u32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            task_type: task_type.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_checked_at: None,
            check_count: 0,
            check_interval_minutes: None,
            metadata: Map::new(),
            result: None,
            error: None,
        }
    }

    /// An `awaiting_check` task whose check interval has elapsed.
    pub fn is_check_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::AwaitingCheck {
            return false;
        }
        let Some(last) = self.last_checked_at else {
            return true;
        };
        let interval = Duration::minutes(i64::from(self.check_interval_minutes.unwrap_or(0)));
        now - last >= interval
    }
}

/// Partial update applied by [`TaskStore::update`]. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub check_interval_minutes: Option<u32>,
    /// Merged key-by-key into the existing metadata; `null` values delete keys.
    pub metadata: Option<Map<String, Value>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Document for TaskDocument {}

pub struct TaskStore {
    inner: JsonStore<TaskDocument>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::new(path),
        }
    }

    /// Store at `{workspace}/state/tasks.json`.
    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join("state").join("tasks.json"))
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Append a task. Tasks are a list-style store: no uniqueness check.
    pub async fn create(&self, task: Task) -> Result<Task> {
        let saved = task.clone();
        self.inner
            .mutate(move |doc| {
                doc.tasks.push(task);
                Ok(())
            })
            .await?;
        Ok(saved)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.load().await.tasks.into_iter().find(|t| t.id == id)
    }

    pub async fn list(&self) -> Vec<Task> {
        self.inner.load().await.tasks
    }

    pub async fn list_active(&self) -> Vec<Task> {
        self.list().await.into_iter().filter(|t| t.status.is_active()).collect()
    }

    pub async fn due_for_check(&self, now: DateTime<Utc>) -> Vec<Task> {
        self.list().await.into_iter().filter(|t| t.is_check_due(now)).collect()
    }

    /// Apply `update` to task `id`. Returns the updated task, or `None` if absent.
    pub async fn update(&self, id: &str, update: TaskUpdate) -> Result<Option<Task>> {
        self.inner
            .mutate(|doc| {
                let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id) else {
                    return Ok(None);
                };
                let now = Utc::now();
                if let Some(status) = update.status {
                    if status != task.status {
                        task.status = status;
                        task.completed_at = if status.is_active() { None } else { Some(now) };
                    }
                }
                if let Some(priority) = update.priority {
                    task.priority = priority;
                }
                if let Some(title) = update.title {
                    task.title = title;
                }
                if let Some(description) = update.description {
                    task.description = description;
                }
                if let Some(minutes) = update.check_interval_minutes {
                    task.check_interval_minutes = Some(minutes);
                }
                if let Some(meta) = update.metadata {
                    for (key, value) in meta {
                        if value.is_null() {
                            task.metadata.remove(&key);
                        } else {
                            task.metadata.insert(key, value);
                        }
                    }
                }
                if let Some(result) = update.result {
                    task.result = Some(result);
                }
                if let Some(error) = update.error {
                    task.error = Some(error);
                }
                task.updated_at = now;
                Ok(Some(task.clone()))
            })
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.inner
            .mutate(|doc| {
                let before = doc.tasks.len();
                doc.tasks.retain(|t| t.id != id);
                Ok(doc.tasks.len() < before)
            })
            .await
    }

    /// Stamp a check on each of `ids`. Returns how many tasks were found.
    pub async fn record_check(&self, ids: &[String], now: DateTime<Utc>) -> Result<usize> {
        self.inner
            .mutate(|doc| {
                let mut n = 0;
                for task in doc.tasks.iter_mut().filter(|t| ids.contains(&t.id)) {
                    task.last_checked_at = Some(now);
                    task.check_count += 1;
                    n += 1;
                }
                Ok(n)
            })
            .await
    }
}

/// Compact one-line-per-task summary for prompts, highest priority first.
pub fn summarize(tasks: &[Task], now: DateTime<Utc>) -> String {
    if tasks.is_empty() {
        return "(no active tasks)".to_string();
    }
    let mut sorted: Vec<&Task> = tasks.iter().collect();
    sorted.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    sorted
        .iter()
        .map(|t| {
            let mut line = format!(
                "- [{}] {} (id {}, type {}, priority {:?})",
                t.status,
                t.title,
                t.id,
                t.task_type,
                t.priority
            );
            if t.is_check_due(now) {
                line.push_str(&format!(" - check due (checked {} times)", t.check_count));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
