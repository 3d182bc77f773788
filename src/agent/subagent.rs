//! Background sub-agents: spawn, supervise against a deadline, sweep.
//!
//! Each spawn persists a request in `pending`, then a supervisor task moves it
//! to `running`, invokes the agent on a separate task and races that against
//! the request's timeout. Whatever ends first writes the terminal status and
//! the single result together. A timed-out invocation is not stopped; when it
//! eventually returns, nobody is listening.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{
    race_deadline, spawn_invocation, AgentInvoker, InvocationContext, InvocationOrigin, RaceOutcome,
};
use crate::bus::split_session_key;
use crate::delivery::{Deliverer, DeliveryMode, DeliveryTarget};
use crate::store::subagents::{
    DuplicateRequest, SubAgentRequest, SubAgentResult, SubAgentStatus, SweepReport, Transition,
};
use crate::store::SubAgentStore;

#[derive(Debug, Clone)]
pub struct SubAgentSettings {
    pub default_timeout_minutes: u32,
    pub retention: chrono::Duration,
    pub max_concurrent: usize,
}

impl Default for SubAgentSettings {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 30,
            retention: chrono::Duration::hours(24),
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubAgentError {
    #[error("Sub-agent limit reached ({max} active). Wait for one to finish or cancel one first")]
    LimitReached { max: usize },

    #[error("sub-agent request '{0}' already exists")]
    Duplicate(String),

    #[error("unknown sub-agent '{0}'")]
    NotFound(String),

    #[error("sub-agent '{id}' already finished with status {status}")]
    AlreadyFinished { id: String, status: SubAgentStatus },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Parameters for [`SubAgentManager::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub task: String,
    pub label: Option<String>,
    pub timeout_minutes: Option<u32>,
    /// `channel:chat_id` the result belongs to.
    pub session_key: Option<String>,
    pub notify: bool,
    pub allowed_tools: Option<Vec<String>>,
    pub denied_tools: Option<Vec<String>>,
}

impl SpawnRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }
}

pub struct SubAgentManager {
    store: Arc<SubAgentStore>,
    invoker: Arc<dyn AgentInvoker>,
    deliverer: Option<Arc<Deliverer>>,
    settings: SubAgentSettings,
    /// Supervisor handles by request id. Also serializes admission.
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SubAgentManager {
    pub fn new(
        store: Arc<SubAgentStore>,
        invoker: Arc<dyn AgentInvoker>,
        settings: SubAgentSettings,
    ) -> Self {
        Self {
            store,
            invoker,
            deliverer: None,
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Route `notify` results back into the agent inbox through `deliverer`.
    pub fn with_deliverer(mut self, deliverer: Arc<Deliverer>) -> Self {
        self.deliverer = Some(deliverer);
        self
    }

    pub fn store(&self) -> &Arc<SubAgentStore> {
        &self.store
    }

    /// Startup maintenance: time out requests orphaned by a previous process
    /// once they are overdue, and prune old terminal records.
    pub async fn initialize(&self) -> anyhow::Result<SweepReport> {
        let report = self.sweep().await?;
        info!(
            timed_out = report.timed_out,
            pruned = report.pruned,
            "Sub-agent store initialized"
        );
        Ok(report)
    }

    pub async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let report = self.store.sweep(Utc::now(), self.settings.retention).await?;
        if !report.is_empty() {
            info!(timed_out = report.timed_out, pruned = report.pruned, "Sub-agent sweep");
        }
        Ok(report)
    }

    /// Number of supervisors still running.
    pub async fn active_count(&self) -> usize {
        let mut running = self.running.lock().await;
        running.retain(|_, h| !h.is_finished());
        running.len()
    }

    pub async fn spawn(&self, req: SpawnRequest) -> Result<SubAgentRequest, SubAgentError> {
        let mut running = self.running.lock().await;
        running.retain(|_, h| !h.is_finished());

        let max = self.settings.max_concurrent;
        if self.store.count_active().await >= max {
            return Err(SubAgentError::LimitReached { max });
        }

        let id = short_id();
        let label = req
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| req.task.chars().take(30).collect());
        let request = SubAgentRequest {
            id: id.clone(),
            task: req.task,
            label,
            status: SubAgentStatus::Pending,
            session_key: req.session_key,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_minutes: req
                .timeout_minutes
                .unwrap_or(self.settings.default_timeout_minutes)
                .max(1),
            notify: req.notify,
            allowed_tools: req.allowed_tools,
            denied_tools: req.denied_tools,
        };

        if let Err(e) = self.store.create(request.clone()).await {
            return Err(match e.downcast::<DuplicateRequest>() {
                Ok(dup) => SubAgentError::Duplicate(dup.0),
                Err(e) => SubAgentError::Store(e),
            });
        }

        let handle = tokio::spawn(supervise(
            Arc::clone(&self.store),
            Arc::clone(&self.invoker),
            self.deliverer.clone(),
            request.clone(),
        ));
        running.insert(id.clone(), handle);

        info!(subagent_id = %id, label = %request.label, timeout_minutes = request.timeout_minutes, "Sub-agent spawned");
        Ok(request)
    }

    /// Mark a non-terminal request cancelled. The invocation itself is not
    /// interrupted; its result is discarded when it arrives.
    pub async fn cancel(&self, id: &str) -> Result<SubAgentRequest, SubAgentError> {
        let result = SubAgentResult {
            request_id: id.to_string(),
            output: "[Sub-agent cancelled]".to_string(),
            token_count: 0,
            duration_ms: 0,
            error: Some("cancelled".to_string()),
            truncated: false,
        };
        match self
            .store
            .finish(id, SubAgentStatus::Cancelled, result, Utc::now())
            .await?
        {
            Transition::Applied(req) => {
                info!(subagent_id = %id, "Sub-agent cancelled");
                Ok(req)
            }
            Transition::Rejected(status) => Err(SubAgentError::AlreadyFinished {
                id: id.to_string(),
                status,
            }),
            Transition::Missing => Err(SubAgentError::NotFound(id.to_string())),
        }
    }

    pub async fn get(&self, id: &str) -> Option<SubAgentRequest> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Vec<SubAgentRequest> {
        self.store.list().await
    }

    pub async fn result(&self, id: &str) -> Option<SubAgentResult> {
        self.store.result(id).await
    }

    /// Wait for the supervisor of `id` to finish, then return its result.
    pub async fn wait(&self, id: &str) -> Result<Option<SubAgentResult>, SubAgentError> {
        let handle = self.running.lock().await.remove(id);
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(subagent_id = %id, error = %e, "Sub-agent supervisor crashed");
                }
            }
            None if self.store.get(id).await.is_none() => {
                return Err(SubAgentError::NotFound(id.to_string()));
            }
            None => {}
        }
        Ok(self.store.result(id).await)
    }

    /// Abort all supervisors. Their invocations keep running detached.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (_, handle) in running.drain() {
            handle.abort();
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

async fn supervise(
    store: Arc<SubAgentStore>,
    invoker: Arc<dyn AgentInvoker>,
    deliverer: Option<Arc<Deliverer>>,
    request: SubAgentRequest,
) {
    let id = request.id.clone();
    match store.transition(&id, SubAgentStatus::Running, Utc::now()).await {
        Ok(Transition::Applied(_)) => {}
        Ok(other) => {
            debug!(subagent_id = %id, outcome = ?other, "Sub-agent not started");
            return;
        }
        Err(e) => {
            error!(subagent_id = %id, error = %e, "Failed to mark sub-agent running");
            return;
        }
    }

    let ctx = InvocationContext::new(InvocationOrigin::SubAgent { id: id.clone() })
        .with_session_key(request.session_key.clone())
        .with_tools(request.allowed_tools.clone(), request.denied_tools.clone());
    let deadline = Duration::from_secs(u64::from(request.timeout_minutes) * 60);
    let started = Instant::now();
    let handle = spawn_invocation(invoker, ctx, request.task.clone());
    let outcome = race_deadline(handle, Some(deadline)).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, result) = match outcome {
        RaceOutcome::Finished(Ok(reply)) => (
            SubAgentStatus::Completed,
            SubAgentResult {
                request_id: id.clone(),
                output: reply.text,
                token_count: reply.metrics.total_tokens(),
                duration_ms,
                error: None,
                truncated: false,
            },
        ),
        RaceOutcome::Finished(Err(e)) => (SubAgentStatus::Failed, failed(&id, format!("{e:#}"), duration_ms)),
        RaceOutcome::Crashed(msg) => (SubAgentStatus::Failed, failed(&id, msg, duration_ms)),
        RaceOutcome::DeadlineElapsed => (
            SubAgentStatus::TimedOut,
            SubAgentResult::timed_out(&id, request.timeout_minutes, duration_ms),
        ),
    };

    match store.finish(&id, status, result.clone(), Utc::now()).await {
        Ok(Transition::Applied(req)) => {
            info!(subagent_id = %id, status = %status, duration_ms, "Sub-agent finished");
            if req.notify {
                if let Some(deliverer) = &deliverer {
                    notify(deliverer, &req, &result).await;
                }
            }
        }
        Ok(Transition::Rejected(current)) => {
            debug!(subagent_id = %id, current = %current, "Late sub-agent result discarded");
        }
        Ok(Transition::Missing) => {
            debug!(subagent_id = %id, "Sub-agent request vanished before finishing");
        }
        Err(e) => error!(subagent_id = %id, error = %e, "Failed to record sub-agent result"),
    }
}

fn failed(id: &str, error: String, duration_ms: u64) -> SubAgentResult {
    SubAgentResult {
        request_id: id.to_string(),
        output: String::new(),
        token_count: 0,
        duration_ms,
        error: Some(error),
        truncated: false,
    }
}

async fn notify(deliverer: &Deliverer, req: &SubAgentRequest, result: &SubAgentResult) {
    let (channel, chat_id) = match req.session_key.as_deref().and_then(split_session_key) {
        Some((ch, chat)) => (Some(ch.to_string()), Some(chat.to_string())),
        None => (None, None),
    };
    let target = DeliveryTarget {
        mode: DeliveryMode::Agent,
        channel,
        chat_id,
    };
    let body = match &result.error {
        Some(err) if result.output.is_empty() => format!("Error: {err}"),
        _ => result.output.clone(),
    };
    let text = format!("[Sub-agent '{}' {}]\n\n{}", req.label, req.status, body);
    let report = deliverer
        .deliver(&format!("subagent-{}", req.id), &target, &text)
        .await;
    if let Some(err) = report.error_summary() {
        warn!(subagent_id = %req.id, error = %err, "Sub-agent notification failed");
    }
}
