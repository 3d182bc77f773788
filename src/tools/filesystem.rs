//! File-system tools: read_file, write_file, list_dir.
//!
//! Every path goes through the workspace [`PathSandbox`]: reads may touch any
//! non-traversing path under the root, writes are refused inside protected
//! directories. Files are opened with no-follow semantics.

use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

use crate::sandbox::{fs, AccessMode, PathSandbox};
use crate::tools::{str_arg, DynTool, ToolContext};

/// Largest file `read_file` returns in full, in characters.
const MAX_READ_CHARS: usize = 100_000;

fn resolve(sandbox: &PathSandbox, path: &str, mode: AccessMode) -> anyhow::Result<PathBuf> {
    Ok(sandbox.resolve(path, mode)?)
}

// ---- ReadFile ----

pub struct ReadFileTool {
    pub sandbox: PathSandbox,
}

#[async_trait::async_trait]
impl DynTool for ReadFileTool {
    fn name(&self) -> &str { "read_file" }
    fn description(&self) -> &str { "Read a text file from the workspace (path relative to the workspace root)." }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","properties":{"path":{"type":"string"}},"required":["path"]})
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let rel = str_arg(&args, "path")?;
        let path = resolve(&self.sandbox, rel, AccessMode::Read)?;
        info!(agent_id = %ctx.agent_id, path = %rel, "read_file");
        let content = fs::read_to_string(self.sandbox.root(), &path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read '{}': {}", rel, e))?;
        let total = content.chars().count();
        if total > MAX_READ_CHARS {
            let kept: String = content.chars().take(MAX_READ_CHARS).collect();
            return Ok(format!("{kept}\n\n[... truncated: showing {MAX_READ_CHARS} of {total} characters]"));
        }
        Ok(content)
    }
}

// ---- WriteFile ----

pub struct WriteFileTool {
    pub sandbox: PathSandbox,
}

#[async_trait::async_trait]
impl DynTool for WriteFileTool {
    fn name(&self) -> &str { "write_file" }
    fn description(&self) -> &str { "Write content to a workspace file (creates dirs if needed). Protected directories are read-only." }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","properties":{"path":{"type":"string"},"content":{"type":"string"}},"required":["path","content"]})
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let rel = str_arg(&args, "path")?;
        let content = args["content"].as_str().unwrap_or("");
        let path = resolve(&self.sandbox, rel, AccessMode::Write)?;
        info!(agent_id = %ctx.agent_id, path = %rel, len = content.len(), "write_file");
        fs::write(self.sandbox.root(), &path, content.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("cannot write '{}': {}", rel, e))?;
        Ok(format!("Wrote {} bytes to {}", content.len(), rel))
    }
}

// ---- ListDir ----

pub struct ListDirTool {
    pub sandbox: PathSandbox,
}

#[async_trait::async_trait]
impl DynTool for ListDirTool {
    fn name(&self) -> &str { "list_dir" }
    fn description(&self) -> &str {
        "List contents of a workspace directory: returns both subdirectories and files, clearly labeled."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","properties":{"path":{"type":"string","description":"Directory path (default '.' for the workspace root)"}}})
    }
    async fn call(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let rel = args["path"].as_str().filter(|s| !s.trim().is_empty()).unwrap_or(".");
        let path = resolve(&self.sandbox, rel, AccessMode::Read)?;
        info!(agent_id = %ctx.agent_id, path = %rel, "list_dir");
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot list '{}': {}", rel, e))?;
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let ft = entry.file_type().await?;
            if ft.is_dir() {
                dirs.push(name);
            } else if ft.is_symlink() {
                files.push(format!("{name} (symlink)"));
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();
        let mut out = Vec::new();
        if !dirs.is_empty() {
            out.push("Directories:".to_string());
            for d in &dirs {
                out.push(format!("  {} (dir)", d));
            }
        }
        if !files.is_empty() {
            out.push("Files:".to_string());
            for f in &files {
                out.push(format!("  {}", f));
            }
        }
        if out.is_empty() {
            out.push("(empty directory)".to_string());
        }
        Ok(out.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxViolation;
    use tempfile::TempDir;

    fn sandbox(dir: &TempDir) -> PathSandbox {
        PathSandbox::new(dir.path())
            .with_protected_dirs(["state"])
            .with_writable_exceptions(["state/scratch.md"])
    }

    #[tokio::test]
    async fn write_then_read_inside_workspace() {
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::detached();
        let write = WriteFileTool { sandbox: sandbox(&dir) };
        let read = ReadFileTool { sandbox: sandbox(&dir) };

        let msg = write
            .call(&ctx, json!({"path": "notes/today.md", "content": "buy milk"}))
            .await
            .unwrap();
        assert_eq!(msg, "Wrote 8 bytes to notes/today.md");
        let content = read.call(&ctx, json!({"path": "notes/today.md"})).await.unwrap();
        assert_eq!(content, "buy milk");
    }

    #[tokio::test]
    async fn protected_write_is_refused_with_relative_message() {
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::detached();
        let write = WriteFileTool { sandbox: sandbox(&dir) };

        let err = write
            .call(&ctx, json!({"path": "state/tasks.json", "content": "{}"}))
            .await
            .unwrap_err();
        let violation = err.downcast_ref::<SandboxViolation>().unwrap();
        assert_eq!(violation.code(), "SANDBOX_PROTECTED_DIRECTORY");
        assert!(!err.to_string().contains(&dir.path().display().to_string()));
        assert!(!dir.path().join("state/tasks.json").exists());

        write
            .call(&ctx, json!({"path": "state/scratch.md", "content": "ok"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn traversal_is_refused_for_reads() {
        let dir = TempDir::new().unwrap();
        let read = ReadFileTool { sandbox: sandbox(&dir) };
        let err = read
            .call(&ToolContext::detached(), json!({"path": "../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }

    #[tokio::test]
    async fn list_dir_labels_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "x").unwrap();
        let list = ListDirTool { sandbox: sandbox(&dir) };

        let out = list.call(&ToolContext::detached(), json!({})).await.unwrap();
        assert!(out.contains("Directories:\n  docs (dir)"));
        assert!(out.contains("Files:\n  HEARTBEAT.md"));
        let empty = list.call(&ToolContext::detached(), json!({"path": "docs"})).await.unwrap();
        assert_eq!(empty, "(empty directory)");
    }
}
