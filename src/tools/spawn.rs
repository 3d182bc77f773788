//! Sub-agent tools: spawn_subagent, subagent_status, cancel_subagent.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};

use crate::agent::subagent::{SpawnRequest, SubAgentError, SubAgentManager};
use crate::store::subagents::SubAgentRequest;
use crate::tools::{str_arg, DynTool, ToolContext};

fn string_list(args: &Value, key: &str) -> Option<Vec<String>> {
    args.get(key)?.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

fn status_line(req: &SubAgentRequest) -> String {
    format!("[{}] {} - {}", req.id, req.status, req.label)
}

/// Runs a task on a background sub-agent, reporting back to the calling conversation.
pub struct SpawnSubAgentTool {
    pub manager: Arc<SubAgentManager>,
}

#[async_trait::async_trait]
impl DynTool for SpawnSubAgentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }
    fn description(&self) -> &str {
        "Spawn a sub-agent to handle a task in the background. Use subagent_status to check on it."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "Task description" },
                "label": { "type": "string", "description": "Human-readable label" },
                "timeout_minutes": { "type": "integer", "minimum": 1 },
                "notify": { "type": "boolean", "description": "Post the result back into this conversation when done" },
                "allowed_tools": { "type": "array", "items": { "type": "string" } },
                "denied_tools": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["task"]
        })
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let task = str_arg(&args, "task")?;
        let request = SpawnRequest {
            task: task.to_string(),
            label: args["label"].as_str().map(str::to_string),
            timeout_minutes: args["timeout_minutes"]
                .as_u64()
                .map(|m| m.min(u64::from(u32::MAX)) as u32),
            session_key: ctx.session_key().map(str::to_string),
            notify: args["notify"].as_bool().unwrap_or(false),
            allowed_tools: string_list(&args, "allowed_tools"),
            denied_tools: string_list(&args, "denied_tools"),
        };
        match self.manager.spawn(request).await {
            Ok(req) => Ok(format!(
                "Sub-agent [{}] spawned with id '{}' (timeout {} min). Use subagent_status to check on it.",
                req.label, req.id, req.timeout_minutes
            )),
            Err(e @ SubAgentError::LimitReached { .. }) => Ok(e.to_string()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reports one sub-agent (with its result once finished), or all of them.
pub struct SubAgentStatusTool {
    pub manager: Arc<SubAgentManager>,
}

#[async_trait::async_trait]
impl DynTool for SubAgentStatusTool {
    fn name(&self) -> &str {
        "subagent_status"
    }
    fn description(&self) -> &str {
        "Show a sub-agent's status and result. Without an id, list all sub-agents."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string", "description": "Sub-agent id" } }
        })
    }
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String> {
        let Some(id) = args["id"].as_str().filter(|s| !s.trim().is_empty()) else {
            let all = self.manager.list().await;
            if all.is_empty() {
                return Ok("No sub-agents.".to_string());
            }
            return Ok(all.iter().map(status_line).collect::<Vec<_>>().join("\n"));
        };

        let req = self
            .manager
            .get(id)
            .await
            .ok_or_else(|| SubAgentError::NotFound(id.to_string()))?;
        let mut out = status_line(&req);
        if let Some(result) = self.manager.result(id).await {
            if let Some(err) = &result.error {
                out.push_str(&format!("\nError: {err}"));
            }
            if !result.output.is_empty() {
                out.push_str(&format!("\n\n{}", result.output));
            }
        }
        Ok(out)
    }
}

pub struct CancelSubAgentTool {
    pub manager: Arc<SubAgentManager>,
}

#[async_trait::async_trait]
impl DynTool for CancelSubAgentTool {
    fn name(&self) -> &str {
        "cancel_subagent"
    }
    fn description(&self) -> &str {
        "Cancel a pending or running sub-agent. Its result, if it arrives later, is discarded."
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
        match self.manager.cancel(id).await {
            Ok(req) => Ok(format!("Cancelled sub-agent [{}] '{}'", req.id, req.label)),
            Err(e @ SubAgentError::AlreadyFinished { .. }) => Ok(e.to_string()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::subagent::SubAgentSettings;
    use crate::agent::{AgentInvoker, AgentReply, InvocationContext, InvocationOrigin};
    use crate::store::SubAgentStore;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait::async_trait]
    impl AgentInvoker for Echo {
        async fn invoke(&self, ctx: &InvocationContext, prompt: &str) -> Result<AgentReply> {
            if prompt == "hang" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(AgentReply::text(format!(
                "{prompt} for {}",
                ctx.session_key.as_deref().unwrap_or("nobody")
            )))
        }
    }

    fn manager(dir: &TempDir, max: usize) -> Arc<SubAgentManager> {
        Arc::new(SubAgentManager::new(
            Arc::new(SubAgentStore::in_workspace(dir.path())),
            Arc::new(Echo),
            SubAgentSettings {
                max_concurrent: max,
                ..Default::default()
            },
        ))
    }

    fn chat_ctx() -> ToolContext {
        let inv = InvocationContext::new(InvocationOrigin::Direct)
            .with_session_key(Some("telegram:42".to_string()));
        ToolContext::from(&inv)
    }

    fn spawned_id(msg: &str) -> String {
        msg.split('\'').nth(1).unwrap().to_string()
    }

    #[tokio::test]
    async fn spawn_routes_to_caller_session_and_reports_result() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 5);
        let spawn = SpawnSubAgentTool { manager: Arc::clone(&mgr) };
        let status = SubAgentStatusTool { manager: Arc::clone(&mgr) };

        let msg = spawn
            .call(&chat_ctx(), json!({"task": "summarize inbox", "label": "inbox"}))
            .await
            .unwrap();
        assert!(msg.contains("spawned with id"));
        let id = spawned_id(&msg);
        assert_eq!(mgr.get(&id).await.unwrap().session_key.as_deref(), Some("telegram:42"));

        mgr.wait(&id).await.unwrap();
        let out = status.call(&chat_ctx(), json!({"id": id})).await.unwrap();
        assert!(out.contains("completed - inbox"));
        assert!(out.contains("summarize inbox for telegram:42"));

        let listing = status.call(&chat_ctx(), json!({})).await.unwrap();
        assert!(listing.starts_with(&format!("[{id}] completed")));
    }

    #[tokio::test]
    async fn limit_is_reported_as_message() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 1);
        let spawn = SpawnSubAgentTool { manager: Arc::clone(&mgr) };

        spawn.call(&chat_ctx(), json!({"task": "hang"})).await.unwrap();
        let msg = spawn.call(&chat_ctx(), json!({"task": "hang"})).await.unwrap();
        assert!(msg.contains("limit reached"), "{msg}");
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_then_cancel_again() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 5);
        let spawn = SpawnSubAgentTool { manager: Arc::clone(&mgr) };
        let cancel = CancelSubAgentTool { manager: Arc::clone(&mgr) };

        let id = spawned_id(&spawn.call(&chat_ctx(), json!({"task": "hang"})).await.unwrap());
        let first = cancel.call(&chat_ctx(), json!({"id": id})).await.unwrap();
        assert!(first.starts_with("Cancelled sub-agent"));
        let second = cancel.call(&chat_ctx(), json!({"id": id})).await.unwrap();
        assert!(second.contains("already finished with status cancelled"));
        assert!(cancel.call(&chat_ctx(), json!({"id": "nope"})).await.is_err());
        mgr.shutdown().await;
    }
}
