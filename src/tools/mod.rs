pub mod context;
pub mod filesystem;
pub mod schedule;
pub mod spawn;
pub mod tasks;

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, Instrument};

pub use context::ToolContext;

/// Build a short string for logging tool args (path, prompt, etc.) without leaking full content.
fn sanitize_args_for_log(tool_name: &str, args: &Value) -> String {
    let obj = match args.as_object() {
        Some(o) => o,
        None => return "args=?".to_string(),
    };
    let part = match tool_name {
        "read_file" | "write_file" | "list_dir" => obj
            .get("path")
            .and_then(|v| v.as_str())
            .map(|s| format!("path={}", truncate_for_log(s, 120))),
        "schedule_at" | "schedule_every" => obj
            .get("prompt")
            .and_then(|v| v.as_str())
            .map(|s| format!("prompt_len={}", s.chars().count())),
        "spawn_subagent" => obj
            .get("task")
            .and_then(|v| v.as_str())
            .map(|s| format!("task={}", truncate_for_log(s, 80))),
        "cancel_scheduled_task" | "subagent_status" | "cancel_subagent" | "update_task" => obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| format!("id={}", s)),
        _ => None,
    };
    part.unwrap_or_else(|| "args=...".to_string())
}

fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len.min(s.len());
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... ({} chars)", &s[..end], s.len())
    }
}

/// Required string argument.
pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{}'", key))
}

/// A type-erased tool that can be stored in the registry.
#[async_trait::async_trait]
pub trait DynTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    /// Capability probe, checked once at registration.
    fn is_available(&self) -> bool {
        true
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String>;
}

/// Metadata about a registered tool, returned by `list_tools`.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Registry that holds all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn DynTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Returns an error if a tool with the same name already exists.
    pub fn register(&mut self, tool: Arc<dyn DynTool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            anyhow::bail!("Tool '{}' is already registered", name);
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Register `tool` only if its capability probe passes. Returns whether it was added.
    pub fn register_available(&mut self, tool: Arc<dyn DynTool>) -> Result<bool> {
        if !tool.is_available() {
            info!(tool_name = %tool.name(), "Tool unavailable, skipped");
            return Ok(false);
        }
        self.register(tool)?;
        Ok(true)
    }

    /// Remove a tool by name. Returns `true` if it was registered.
    pub fn deregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Return metadata about all registered tools.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DynTool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub async fn execute(&self, ctx: &ToolContext, name: &str, args: Value) -> Result<String> {
        let args_for_log = sanitize_args_for_log(name, &args);
        let span = tracing::info_span!(
            "tool_execution",
            tool_name = %name,
            agent_id = %ctx.agent_id,
            args = %args_for_log,
        );
        self.execute_inner(ctx, name, args).instrument(span).await
    }

    async fn execute_inner(&self, ctx: &ToolContext, name: &str, args: Value) -> Result<String> {
        if !ctx.permits(name) {
            info!(tool_name = %name, status = "denied", "Tool not permitted in this context");
            anyhow::bail!("Tool '{}' is not permitted in this context", name);
        }

        debug!(tool_name = %name, args = ?args, "Tool call started");
        let start = std::time::Instant::now();
        let result = match self.tools.get(name) {
            Some(tool) => tool.call(ctx, args).await,
            None => anyhow::bail!("Tool '{}' not found", name),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(s) => {
                let result_preview = truncate_for_log(s, 200);
                info!(
                    tool_name = %name,
                    duration_ms = duration_ms,
                    status = "success",
                    result_preview = %result_preview,
                    "Tool execution completed"
                );
            }
            Err(e) => {
                info!(
                    tool_name = %name,
                    duration_ms = duration_ms,
                    status = "failure",
                    error = %e,
                    "Tool execution failed"
                );
            }
        }

        result
    }
}
