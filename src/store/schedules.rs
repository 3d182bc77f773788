//! Agent-created schedule tasks (`state/schedules.json`), stored as a flat array.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::types::{DynamicScheduleTask, ScheduleKind};

use super::{Document, JsonStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleDocument(pub Vec<DynamicScheduleTask>);

impl Document for ScheduleDocument {}

pub struct DynamicScheduleStore {
    inner: JsonStore<ScheduleDocument>,
}

impl DynamicScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::new(path),
        }
    }

    /// Store at `{workspace}/state/schedules.json`.
    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join("state").join("schedules.json"))
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub async fn list(&self) -> Vec<DynamicScheduleTask> {
        self.inner.load().await.0
    }

    pub async fn get(&self, id: &str) -> Option<DynamicScheduleTask> {
        self.list().await.into_iter().find(|t| t.id == id)
    }

    /// Append a task. Fails if a task with the same id is already stored.
    pub async fn add(&self, task: DynamicScheduleTask) -> Result<()> {
        self.inner
            .mutate(move |doc| {
                if doc.0.iter().any(|t| t.id == task.id) {
                    anyhow::bail!("scheduled task '{}' already exists", task.id);
                }
                doc.0.push(task);
                Ok(())
            })
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.inner
            .mutate(|doc| {
                let before = doc.0.len();
                doc.0.retain(|t| t.id != id);
                Ok(doc.0.len() < before)
            })
            .await
    }

    /// Move an interval task's `next_run`. Returns false if the task is gone.
    pub async fn set_next_run(&self, id: &str, next: DateTime<Utc>) -> Result<bool> {
        self.inner
            .mutate(|doc| {
                for task in doc.0.iter_mut().filter(|t| t.id == id) {
                    if let ScheduleKind::Interval { next_run, .. } = &mut task.kind {
                        *next_run = next;
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .await
    }

    /// Drop one-shot tasks whose `run_at` is already past. Returns the pruned tasks.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<Vec<DynamicScheduleTask>> {
        self.inner
            .mutate(|doc| {
                let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut doc.0)
                    .into_iter()
                    .partition(|t| matches!(t.kind, ScheduleKind::Once { run_at } if run_at <= now));
                doc.0 = keep;
                Ok(expired)
            })
            .await
    }
}
