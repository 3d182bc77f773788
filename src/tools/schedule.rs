//! Agent-created timers: schedule_at, schedule_every, list_scheduled_tasks,
//! cancel_scheduled_task.
//!
//! Tasks created here report back to the conversation that created them.
//! Admission rejections (limit, interval, past time) come back to the agent as
//! plain text so it can correct itself.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::cron::config_runner::add_seconds;
use crate::cron::{ScheduleEngine, ScheduleError};
use crate::delivery::DeliveryMode;
use crate::tools::{str_arg, DynTool, ToolContext};

const DELIVERY_SCHEMA: &str = "Where the result goes: 'channel' (default), 'agent' or 'both'";

fn delivery_arg(args: &Value) -> Result<DeliveryMode> {
    match args.get("delivery") {
        None | Some(Value::Null) => Ok(DeliveryMode::default()),
        Some(v) => serde_json::from_value(v.clone())
            .with_context(|| format!("invalid delivery {v} (expected channel, agent or both)")),
    }
}

/// Admission errors become the tool's answer; anything else is a real failure.
fn admission(err: ScheduleError) -> Result<String> {
    match err {
        ScheduleError::TaskLimit { .. }
        | ScheduleError::IntervalTooShort { .. }
        | ScheduleError::NotInFuture { .. }
        | ScheduleError::OutOfRange { .. } => Ok(err.to_string()),
        other => Err(other.into()),
    }
}

pub struct ScheduleAtTool {
    pub engine: ScheduleEngine,
}

#[async_trait::async_trait]
impl DynTool for ScheduleAtTool {
    fn name(&self) -> &str {
        "schedule_at"
    }
    fn description(&self) -> &str {
        "Run a prompt once at a future time. Give either run_at (RFC 3339) or delay_seconds."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "What to do when the time comes" },
                "run_at": { "type": "string", "description": "RFC 3339 timestamp, e.g. 2026-01-31T09:00:00+01:00" },
                "delay_seconds": { "type": "integer", "minimum": 1 },
                "delivery": { "type": "string", "enum": ["channel", "agent", "both"], "description": DELIVERY_SCHEMA }
            },
            "required": ["prompt"]
        })
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let prompt = str_arg(&args, "prompt")?;
        let run_at: DateTime<Utc> = match (args["run_at"].as_str(), args["delay_seconds"].as_i64()) {
            (Some(ts), _) => DateTime::parse_from_rfc3339(ts)
                .with_context(|| format!("invalid run_at '{ts}' (expected RFC 3339)"))?
                .with_timezone(&Utc),
            (None, Some(secs)) => match add_seconds(Utc::now(), secs) {
                Some(at) => at,
                None => {
                    return Ok(ScheduleError::OutOfRange {
                        field: "delay_seconds",
                        requested: secs.to_string(),
                    }
                    .to_string())
                }
            },
            (None, None) => anyhow::bail!("either run_at or delay_seconds is required"),
        };
        let route = ctx.route(delivery_arg(&args)?);
        match self.engine.schedule_at(prompt, run_at, route).await {
            Ok(task) => Ok(format!(
                "Scheduled task '{}' to run once at {}",
                task.id,
                run_at.to_rfc3339()
            )),
            Err(e) => admission(e),
        }
    }
}

pub struct ScheduleEveryTool {
    pub engine: ScheduleEngine,
}

#[async_trait::async_trait]
impl DynTool for ScheduleEveryTool {
    fn name(&self) -> &str {
        "schedule_every"
    }
    fn description(&self) -> &str {
        "Run a prompt repeatedly every interval_seconds until cancelled."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string" },
                "interval_seconds": { "type": "integer", "minimum": 1 },
                "delivery": { "type": "string", "enum": ["channel", "agent", "both"], "description": DELIVERY_SCHEMA }
            },
            "required": ["prompt", "interval_seconds"]
        })
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let prompt = str_arg(&args, "prompt")?;
        let interval = args["interval_seconds"]
            .as_u64()
            .context("interval_seconds must be a positive integer")?;
        let route = ctx.route(delivery_arg(&args)?);
        match self.engine.schedule_every(prompt, interval, route).await {
            Ok(task) => Ok(format!(
                "Scheduled task '{}' to run every {}s, first at {}",
                task.id,
                interval,
                task.next_fire().to_rfc3339()
            )),
            Err(e) => admission(e),
        }
    }
}

pub struct ListScheduledTasksTool {
    pub engine: ScheduleEngine,
}

#[async_trait::async_trait]
impl DynTool for ListScheduledTasksTool {
    fn name(&self) -> &str {
        "list_scheduled_tasks"
    }
    fn description(&self) -> &str {
        "List timers created with schedule_at and schedule_every."
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn call(&self, _ctx: &ToolContext, _args: Value) -> Result<String> {
        let mut tasks = self.engine.list_dynamic().await;
        if tasks.is_empty() {
            return Ok("No scheduled tasks.".to_string());
        }
        tasks.sort_by_key(|t| t.next_fire());
        Ok(tasks.iter().map(|t| t.describe()).collect::<Vec<_>>().join("\n"))
    }
}

pub struct CancelScheduledTaskTool {
    pub engine: ScheduleEngine,
}

#[async_trait::async_trait]
impl DynTool for CancelScheduledTaskTool {
    fn name(&self) -> &str {
        "cancel_scheduled_task"
    }
    fn description(&self) -> &str {
        "Cancel a scheduled task by id (see list_scheduled_tasks)."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        })
    }
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String> {
        let id = str_arg(&args, "id")?;
        match self.engine.cancel(id).await {
            Ok(task) => Ok(format!("Cancelled scheduled task '{}'", task.id)),
            Err(ScheduleError::TaskNotFound(id)) => Ok(format!("No scheduled task with id '{id}'")),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInvoker, AgentReply, InvocationContext, InvocationOrigin};
    use crate::cron::SchedulerLimits;
    use crate::delivery::Deliverer;
    use crate::sandbox::PathSandbox;
    use crate::store::DynamicScheduleStore;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Quiet;

    #[async_trait::async_trait]
    impl AgentInvoker for Quiet {
        async fn invoke(&self, _ctx: &InvocationContext, _prompt: &str) -> Result<AgentReply> {
            Ok(AgentReply::text("done"))
        }
    }

    fn engine(dir: &TempDir, max_tasks: usize) -> ScheduleEngine {
        let (tx, _rx) = mpsc::channel(4);
        ScheduleEngine::new(
            Arc::new(DynamicScheduleStore::in_workspace(dir.path())),
            Arc::new(Quiet),
            Arc::new(Deliverer::new(tx, PathSandbox::new(dir.path()))),
            SchedulerLimits {
                max_tasks,
                min_interval_seconds: 60,
                invocation_timeout: None,
            },
        )
    }

    fn chat_ctx() -> ToolContext {
        ToolContext::from(
            &InvocationContext::new(InvocationOrigin::Direct)
                .with_route(Some("telegram".into()), Some("42".into())),
        )
    }

    #[tokio::test]
    async fn schedule_at_records_caller_route() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 20);
        let tool = ScheduleAtTool { engine: engine.clone() };

        let msg = tool
            .call(&chat_ctx(), json!({"prompt": "stand up", "delay_seconds": 3600, "delivery": "both"}))
            .await
            .unwrap();
        assert!(msg.starts_with("Scheduled task '"));
        let tasks = engine.list_dynamic().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].channel.as_deref(), Some("telegram"));
        assert_eq!(tasks[0].chat_id.as_deref(), Some("42"));
        assert_eq!(tasks[0].delivery, DeliveryMode::Both);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn rejections_come_back_as_text() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 1);
        let at = ScheduleAtTool { engine: engine.clone() };
        let every = ScheduleEveryTool { engine: engine.clone() };

        let past = at
            .call(&chat_ctx(), json!({"prompt": "x", "run_at": "2001-01-01T00:00:00Z"}))
            .await
            .unwrap();
        assert!(past.contains("not in the future"));

        let short = every
            .call(&chat_ctx(), json!({"prompt": "x", "interval_seconds": 5}))
            .await
            .unwrap();
        assert!(short.contains("below the minimum of 60s"));

        every
            .call(&chat_ctx(), json!({"prompt": "x", "interval_seconds": 120}))
            .await
            .unwrap();
        let full = every
            .call(&chat_ctx(), json!({"prompt": "y", "interval_seconds": 120}))
            .await
            .unwrap();
        assert!(full.contains("Maximum task limit reached (1)"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn huge_numbers_are_rejected_as_text() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 20);
        let at = ScheduleAtTool { engine: engine.clone() };
        let every = ScheduleEveryTool { engine: engine.clone() };

        let delay = at
            .call(&chat_ctx(), json!({"prompt": "x", "delay_seconds": i64::MAX}))
            .await
            .unwrap();
        assert!(delay.contains("delay_seconds"));
        assert!(delay.contains("out of range"));

        let interval = every
            .call(&chat_ctx(), json!({"prompt": "x", "interval_seconds": u64::MAX / 2}))
            .await
            .unwrap();
        assert!(interval.contains("interval_seconds"));
        assert!(interval.contains("out of range"));
        assert!(engine.list_dynamic().await.is_empty());
    }

    #[tokio::test]
    async fn bad_arguments_are_errors() {
        let dir = TempDir::new().unwrap();
        let at = ScheduleAtTool { engine: engine(&dir, 20) };
        assert!(at.call(&chat_ctx(), json!({"prompt": "x"})).await.is_err());
        assert!(at
            .call(&chat_ctx(), json!({"prompt": "x", "run_at": "tomorrow"}))
            .await
            .is_err());
        assert!(at
            .call(&chat_ctx(), json!({"prompt": "x", "delay_seconds": 60, "delivery": "pigeon"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_and_cancel() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 20);
        let list = ListScheduledTasksTool { engine: engine.clone() };
        let cancel = CancelScheduledTaskTool { engine: engine.clone() };
        assert_eq!(list.call(&chat_ctx(), json!({})).await.unwrap(), "No scheduled tasks.");

        let task = engine
            .schedule_every("water plants", 3600, Default::default())
            .await
            .unwrap();
        let listing = list.call(&chat_ctx(), json!({})).await.unwrap();
        assert!(listing.contains(&format!("[{}] every 3600s", task.id)));

        let msg = cancel.call(&chat_ctx(), json!({"id": task.id})).await.unwrap();
        assert_eq!(msg, format!("Cancelled scheduled task '{}'", task.id));
        let again = cancel.call(&chat_ctx(), json!({"id": task.id})).await.unwrap();
        assert!(again.starts_with("No scheduled task"));
        assert!(engine.list_dynamic().await.is_empty());
    }
}
