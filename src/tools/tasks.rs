//! Task bookkeeping tools: create_task, update_task, list_tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};

use crate::store::tasks::{summarize, Task, TaskPriority, TaskStatus, TaskUpdate};
use crate::store::TaskStore;
use crate::tools::{str_arg, DynTool, ToolContext};

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args[key].as_str().map(str::to_string)
}

fn opt_minutes(args: &Value) -> Result<Option<u32>> {
    match args.get("check_interval_minutes") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let m = v
                .as_u64()
                .and_then(|m| u32::try_from(m).ok())
                .context("check_interval_minutes must be a non-negative integer")?;
            Ok(Some(m))
        }
    }
}

fn format_task(task: &Task) -> String {
    let mut out = format!(
        "[{}] {} ({}, priority {:?}, type {})",
        task.id, task.title, task.status, task.priority, task.task_type
    );
    if !task.description.is_empty() {
        out.push_str(&format!("\n  {}", task.description));
    }
    if let Some(result) = &task.result {
        out.push_str(&format!("\n  result: {result}"));
    }
    if let Some(err) = &task.error {
        out.push_str(&format!("\n  error: {err}"));
    }
    out
}

pub struct CreateTaskTool {
    pub store: Arc<TaskStore>,
}

#[async_trait::async_trait]
impl DynTool for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }
    fn description(&self) -> &str {
        "Track a piece of ongoing work. Active tasks are reviewed on every heartbeat."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "type": { "type": "string", "description": "Free-form category, e.g. 'follow_up' or 'research'" },
                "description": { "type": "string" },
                "priority": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                "status": { "type": "string", "enum": ["pending", "in_progress", "awaiting_check"] },
                "check_interval_minutes": { "type": "integer", "minimum": 0 },
                "metadata": { "type": "object" }
            },
            "required": ["title"]
        })
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let title = str_arg(&args, "title")?;
        let task_type = args["type"].as_str().filter(|s| !s.trim().is_empty()).unwrap_or("general");
        let mut task = Task::new(task_type, title);
        if let Some(d) = opt_str(&args, "description") {
            task.description = d;
        }
        if let Some(p) = args["priority"].as_str() {
            task.priority = p.parse::<TaskPriority>()?;
        }
        if let Some(s) = args["status"].as_str() {
            task.status = s.parse::<TaskStatus>()?;
        }
        task.check_interval_minutes = opt_minutes(&args)?;
        if let Some(meta) = args["metadata"].as_object() {
            task.metadata = meta.clone();
        }
        if let Some(key) = ctx.session_key() {
            task.metadata
                .entry("session_key")
                .or_insert_with(|| Value::String(key.to_string()));
        }
        let task = self.store.create(task).await?;
        Ok(format!("Created task '{}': {}", task.id, task.title))
    }
}

pub struct UpdateTaskTool {
    pub store: Arc<TaskStore>,
}

#[async_trait::async_trait]
impl DynTool for UpdateTaskTool {
    fn name(&self) -> &str {
        "update_task"
    }
    fn description(&self) -> &str {
        "Update a tracked task's status, priority, details or result. Metadata keys set to null are removed."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "status": { "type": "string", "enum": ["pending", "in_progress", "awaiting_check", "completed", "failed", "cancelled"] },
                "priority": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                "title": { "type": "string" },
                "description": { "type": "string" },
                "check_interval_minutes": { "type": "integer", "minimum": 0 },
                "metadata": { "type": "object" },
                "result": { "type": "string" },
                "error": { "type": "string" }
            },
            "required": ["id"]
        })
    }
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String> {
        let id = str_arg(&args, "id")?;
        let update = TaskUpdate {
            status: args["status"].as_str().map(str::parse).transpose()?,
            priority: args["priority"].as_str().map(str::parse).transpose()?,
            title: opt_str(&args, "title"),
            description: opt_str(&args, "description"),
            check_interval_minutes: opt_minutes(&args)?,
            metadata: args["metadata"].as_object().cloned(),
            result: opt_str(&args, "result"),
            error: opt_str(&args, "error"),
        };
        match self.store.update(id, update).await? {
            Some(task) => Ok(format!("Updated task:\n{}", format_task(&task))),
            None => Ok(format!("No task with id '{id}'")),
        }
    }
}

pub struct ListTasksTool {
    pub store: Arc<TaskStore>,
}

#[async_trait::async_trait]
impl DynTool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }
    fn description(&self) -> &str {
        "List tracked tasks. By default only active ones; pass all=true to include finished tasks, or id for one task in detail."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "all": { "type": "boolean" },
                "id": { "type": "string" }
            }
        })
    }
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String> {
        if let Some(id) = args["id"].as_str() {
            return Ok(match self.store.get(id).await {
                Some(task) => format_task(&task),
                None => format!("No task with id '{id}'"),
            });
        }
        let tasks = if args["all"].as_bool().unwrap_or(false) {
            self.store.list().await
        } else {
            self.store.list_active().await
        };
        Ok(summarize(&tasks, Utc::now()))
    }
}
