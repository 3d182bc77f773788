//! Agent invocation seam.
//!
//! The runtime never drives a model itself. Every timer, heartbeat and
//! sub-agent ends in a call to an [`AgentInvoker`] supplied by the embedding
//! application, with an explicit [`InvocationContext`] describing who is
//! asking and on behalf of which session.

pub mod subagent;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// What triggered an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationOrigin {
    Schedule { name: String },
    DynamicTask { id: String },
    Heartbeat,
    SubAgent { id: String },
    Direct,
}

impl fmt::Display for InvocationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOrigin::Schedule { name } => write!(f, "schedule:{name}"),
            InvocationOrigin::DynamicTask { id } => write!(f, "task:{id}"),
            InvocationOrigin::Heartbeat => f.write_str("heartbeat"),
            InvocationOrigin::SubAgent { id } => write!(f, "subagent:{id}"),
            InvocationOrigin::Direct => f.write_str("direct"),
        }
    }
}

/// Per-invocation context, passed explicitly down the call chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub origin: InvocationOrigin,
    /// `channel:chat_id` of the conversation this run belongs to, if any.
    pub session_key: Option<String>,
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    /// When set, only these tools may run.
    pub allowed_tools: Option<Vec<String>>,
    pub denied_tools: Option<Vec<String>>,
}

impl InvocationContext {
    pub fn new(origin: InvocationOrigin) -> Self {
        Self {
            origin,
            session_key: None,
            channel: None,
            chat_id: None,
            allowed_tools: None,
            denied_tools: None,
        }
    }

    pub fn with_route(mut self, channel: Option<String>, chat_id: Option<String>) -> Self {
        self.session_key = match (&channel, &chat_id) {
            (Some(ch), Some(chat)) => Some(format!("{ch}:{chat}")),
            _ => None,
        };
        self.channel = channel;
        self.chat_id = chat_id;
        self
    }

    pub fn with_session_key(mut self, key: Option<String>) -> Self {
        if let Some((ch, chat)) = key.as_deref().and_then(crate::bus::split_session_key) {
            self.channel = Some(ch.to_string());
            self.chat_id = Some(chat.to_string());
        }
        self.session_key = key;
        self
    }

    pub fn with_tools(mut self, allowed: Option<Vec<String>>, denied: Option<Vec<String>>) -> Self {
        self.allowed_tools = allowed;
        self.denied_tools = denied;
        self
    }

    /// Whether `tool` may run under this context. Deny wins over allow.
    pub fn permits_tool(&self, tool: &str) -> bool {
        if let Some(denied) = &self.denied_tools {
            if denied.iter().any(|t| t == tool) {
                return false;
            }
        }
        match &self.allowed_tools {
            Some(allowed) => allowed.iter().any(|t| t == tool),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl InvocationMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentReply {
    pub text: String,
    pub metrics: InvocationMetrics,
    pub tools_used: Vec<String>,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Opaque agent call. How the reply is produced is not this crate's business.
#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, ctx: &InvocationContext, prompt: &str) -> Result<AgentReply>;
}

/// Run `invoker` on its own task so a caller giving up on it does not stop it.
pub fn spawn_invocation(
    invoker: Arc<dyn AgentInvoker>,
    ctx: InvocationContext,
    prompt: String,
) -> JoinHandle<Result<AgentReply>> {
    tokio::spawn(async move { invoker.invoke(&ctx, &prompt).await })
}

#[derive(Debug)]
pub enum RaceOutcome<T> {
    Finished(T),
    DeadlineElapsed,
    /// The task panicked or was aborted.
    Crashed(String),
}

/// Await `handle` until `deadline`. On expiry the handle is dropped, which
/// detaches the task: it keeps running and its eventual output is discarded.
pub async fn race_deadline<T>(handle: JoinHandle<T>, deadline: Option<Duration>) -> RaceOutcome<T> {
    let joined = match deadline {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => return RaceOutcome::DeadlineElapsed,
        },
        None => handle.await,
    };
    match joined {
        Ok(value) => RaceOutcome::Finished(value),
        Err(e) => RaceOutcome::Crashed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn deny_list_wins_over_allow_list() {
        let ctx = InvocationContext::new(InvocationOrigin::Direct).with_tools(
            Some(vec!["read_file".into(), "write_file".into()]),
            Some(vec!["write_file".into()]),
        );
        assert!(ctx.permits_tool("read_file"));
        assert!(!ctx.permits_tool("write_file"));
        assert!(!ctx.permits_tool("list_dir"));
        assert!(InvocationContext::new(InvocationOrigin::Heartbeat).permits_tool("anything"));
    }

    #[test]
    fn session_key_fills_route() {
        let ctx = InvocationContext::new(InvocationOrigin::SubAgent { id: "a1".into() })
            .with_session_key(Some("telegram:42".into()));
        assert_eq!(ctx.channel.as_deref(), Some("telegram"));
        assert_eq!(ctx.chat_id.as_deref(), Some("42"));
        assert_eq!(ctx.origin.to_string(), "subagent:a1");

        let routed = InvocationContext::new(InvocationOrigin::Heartbeat)
            .with_route(Some("discord".into()), Some("7".into()));
        assert_eq!(routed.session_key.as_deref(), Some("discord:7"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_detaches_but_does_not_stop_the_task() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            flag.store(true, Ordering::SeqCst);
            7
        });

        let outcome = race_deadline(handle, Some(Duration::from_secs(60))).await;
        assert!(matches!(outcome, RaceOutcome::DeadlineElapsed));
        assert!(!done.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn finished_and_crashed_outcomes() {
        let ok = race_deadline(tokio::spawn(async { 1 }), None).await;
        assert!(matches!(ok, RaceOutcome::Finished(1)));

        let panicking: JoinHandle<()> = tokio::spawn(async { panic!("boom") });
        let crashed = race_deadline(panicking, Some(Duration::from_secs(5))).await;
        assert!(matches!(crashed, RaceOutcome::Crashed(_)));
    }
}
