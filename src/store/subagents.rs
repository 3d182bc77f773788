//! Background sub-agent requests and their results (`state/subagents.json`).
//!
//! One document holds two parallel collections. There is at most one result
//! per request: saving a result replaces whatever was there.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{Document, JsonStore};

/// Default cap on stored result output, in characters.
pub const DEFAULT_RESULT_CAP: usize = 50_000;

/// Output recorded when a request misses its deadline.
pub const TIMEOUT_PLACEHOLDER: &str = "[Sub-agent timed out before producing a result]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SubAgentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubAgentStatus::Pending | SubAgentStatus::Running)
    }

    /// Forward-only state machine: `pending -> running -> {completed, failed,
    /// timed_out}`, with `cancelled` reachable from any non-terminal state.
    pub fn can_transition_to(self, next: SubAgentStatus) -> bool {
        use SubAgentStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | TimedOut | Cancelled),
            Running => matches!(next, Completed | Failed | TimedOut | Cancelled),
            Completed | Failed | Cancelled | TimedOut => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubAgentStatus::Pending => "pending",
            SubAgentStatus::Running => "running",
            SubAgentStatus::Completed => "completed",
            SubAgentStatus::Failed => "failed",
            SubAgentStatus::Cancelled => "cancelled",
            SubAgentStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for SubAgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentRequest {
    pub id: String,
    pub task: String,
    pub label: String,
    pub status: SubAgentStatus,
    /// `channel:chat_id` the result is routed back to.
    #[serde(default)]
    pub session_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_minutes: u32,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub denied_tools: Option<Vec<String>>,
}

impl SubAgentRequest {
    /// True when a non-terminal request has outlived its own timeout.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && now - self.created_at > Duration::minutes(i64::from(self.timeout_minutes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub request_id: String,
    pub output: String,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

impl SubAgentResult {
    pub fn timed_out(request_id: &str, timeout_minutes: u32, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            output: TIMEOUT_PLACEHOLDER.to_string(),
            token_count: 0,
            duration_ms,
            error: Some(format!("timed out after {timeout_minutes} minutes")),
            truncated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentDocument {
    pub version: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requests: Vec<SubAgentRequest>,
    #[serde(default)]
    pub results: Vec<SubAgentResult>,
}

impl Default for SubAgentDocument {
    fn default() -> Self {
        Self {
            version: 1,
            last_updated: None,
            requests: Vec::new(),
            results: Vec::new(),
        }
    }
}

impl Document for SubAgentDocument {
    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_updated = Some(now);
    }
}

/// Outcome of a status change attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(SubAgentRequest),
    /// The state machine refused the move; carries the current status.
    Rejected(SubAgentStatus),
    Missing,
}

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out == 0 && self.pruned == 0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("sub-agent request '{0}' already exists")]
pub struct DuplicateRequest(pub String);

pub struct SubAgentStore {
    inner: JsonStore<SubAgentDocument>,
    result_cap: usize,
}

impl SubAgentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::new(path),
            result_cap: DEFAULT_RESULT_CAP,
        }
    }

    /// Store at `{workspace}/state/subagents.json`.
    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join("state").join("subagents.json"))
    }

    pub fn with_result_cap(mut self, cap: usize) -> Self {
        self.result_cap = cap;
        self
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub async fn document(&self) -> SubAgentDocument {
        self.inner.load().await
    }

    /// Insert a request. Fails with [`DuplicateRequest`] if the id is taken.
    pub async fn create(&self, request: SubAgentRequest) -> Result<()> {
        self.inner
            .mutate(move |doc| {
                if doc.requests.iter().any(|r| r.id == request.id) {
                    return Err(DuplicateRequest(request.id).into());
                }
                doc.requests.push(request);
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Option<SubAgentRequest> {
        self.inner.load().await.requests.into_iter().find(|r| r.id == id)
    }

    pub async fn list(&self) -> Vec<SubAgentRequest> {
        self.inner.load().await.requests
    }

    pub async fn count_active(&self) -> usize {
        self.list().await.iter().filter(|r| !r.status.is_terminal()).count()
    }

    pub async fn result(&self, request_id: &str) -> Option<SubAgentResult> {
        self.inner
            .load()
            .await
            .results
            .into_iter()
            .find(|r| r.request_id == request_id)
    }

    /// Move request `id` to `next`, honoring the forward-only state machine.
    pub async fn transition(
        &self,
        id: &str,
        next: SubAgentStatus,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        self.inner
            .mutate(|doc| Ok(apply_transition(doc, id, next, now)))
            .await
    }

    /// Move to a terminal status and store its result in one write. The result
    /// is discarded when the transition is refused.
    pub async fn finish(
        &self,
        id: &str,
        next: SubAgentStatus,
        result: SubAgentResult,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let result = cap_result(result, self.result_cap);
        self.inner
            .mutate(move |doc| {
                let outcome = apply_transition(doc, id, next, now);
                if matches!(outcome, Transition::Applied(_)) {
                    replace_result(doc, result);
                }
                Ok(outcome)
            })
            .await
    }

    /// Save `result`, replacing any existing result for the same request.
    pub async fn save_result(&self, result: SubAgentResult) -> Result<()> {
        let result = cap_result(result, self.result_cap);
        self.inner
            .mutate(move |doc| {
                replace_result(doc, result);
                Ok(())
            })
            .await
    }

    /// Delete a request together with its result.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.inner
            .mutate(|doc| {
                let before = doc.requests.len();
                doc.requests.retain(|r| r.id != id);
                doc.results.retain(|r| r.request_id != id);
                Ok(doc.requests.len() < before)
            })
            .await
    }

    /// Time out overdue requests and prune terminal ones older than `retention`.
    ///
    /// Idempotent: a second call with no state change in between finds nothing
    /// to do and leaves the file untouched.
    pub async fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> Result<SweepReport> {
        self.inner
            .mutate(|doc| {
                let mut report = SweepReport::default();

                let overdue: Vec<(String, u32)> = doc
                    .requests
                    .iter()
                    .filter(|r| r.is_overdue(now))
                    .map(|r| (r.id.clone(), r.timeout_minutes))
                    .collect();
                for (id, minutes) in overdue {
                    if let Transition::Applied(req) =
                        apply_transition(doc, &id, SubAgentStatus::TimedOut, now)
                    {
                        let elapsed = (now - req.created_at).num_milliseconds().max(0) as u64;
                        replace_result(doc, SubAgentResult::timed_out(&id, minutes, elapsed));
                        report.timed_out += 1;
                    }
                }

                let cutoff = now - retention;
                let before = doc.requests.len();
                doc.requests.retain(|r| {
                    !(r.status.is_terminal() && r.completed_at.unwrap_or(r.created_at) < cutoff)
                });
                report.pruned = before - doc.requests.len();
                let live: Vec<String> = doc.requests.iter().map(|r| r.id.clone()).collect();
                doc.results.retain(|res| live.contains(&res.request_id));

                Ok(report)
            })
            .await
    }
}

fn apply_transition(
    doc: &mut SubAgentDocument,
    id: &str,
    next: SubAgentStatus,
    now: DateTime<Utc>,
) -> Transition {
    let Some(req) = doc.requests.iter_mut().find(|r| r.id == id) else {
        return Transition::Missing;
    };
    if !req.status.can_transition_to(next) {
        return Transition::Rejected(req.status);
    }
    req.status = next;
    if next == SubAgentStatus::Running {
        req.started_at = Some(now);
    }
    if next.is_terminal() {
        req.completed_at = Some(now);
    }
    Transition::Applied(req.clone())
}

fn replace_result(doc: &mut SubAgentDocument, result: SubAgentResult) {
    doc.results.retain(|r| r.request_id != result.request_id);
    doc.results.push(result);
}

fn cap_result(mut result: SubAgentResult, cap: usize) -> SubAgentResult {
    let total = result.output.chars().count();
    if total > cap {
        let mut kept: String = result.output.chars().take(cap).collect();
        kept.push_str(&format!("\n\n[... output truncated: {total} characters total, first {cap} kept]"));
        result.output = kept;
        result.truncated = true;
    }
    result
}
