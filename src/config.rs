use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cron::types::ScheduleDefinition;
use crate::delivery::DeliveryMode;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text`, `compact`, `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log directory. Defaults to `~/.synward/logs`.
    #[serde(default)]
    pub dir: Option<String>,
    /// Per-module overrides, e.g. `{"synward::cron": "debug"}`.
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
    /// `local`, `utc` or `rfc3339`.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default)]
    pub show_file: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_timestamp_format() -> String {
    "local".into()
}
fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
            module_levels: HashMap::new(),
            timestamp_format: default_timestamp_format(),
            show_target: true,
            show_file: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Workspace-relative directories the agent may read but never write.
    #[serde(default = "default_protected_dirs")]
    pub protected_dirs: Vec<String>,
    /// Exact workspace-relative files that stay writable inside protected dirs.
    #[serde(default)]
    pub writable_exceptions: Vec<String>,
}

fn default_protected_dirs() -> Vec<String> {
    vec!["state".into(), "identity".into()]
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            protected_dirs: default_protected_dirs(),
            writable_exceptions: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Ceiling on outstanding agent-created tasks.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Floor for `schedule_every` intervals.
    #[serde(default = "default_min_interval")]
    pub min_interval_seconds: u64,
    /// Characters of output injected back into the agent before truncating.
    #[serde(default = "default_agent_output_limit")]
    pub agent_output_limit: usize,
    /// Per-firing deadline; absent means wait as long as the agent takes.
    #[serde(default)]
    pub invocation_timeout_secs: Option<u64>,
}

fn default_max_tasks() -> usize {
    20
}
fn default_min_interval() -> u64 {
    60
}
fn default_agent_output_limit() -> usize {
    crate::delivery::DEFAULT_AGENT_OUTPUT_LIMIT
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            min_interval_seconds: default_min_interval(),
            agent_output_limit: default_agent_output_limit(),
            invocation_timeout_secs: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u64,
    /// `HH:MM-HH:MM` in local time; absent means always active.
    #[serde(default)]
    pub active_hours: Option<String>,
    #[serde(default = "default_true")]
    pub suppress_ok: bool,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default = "default_note_path")]
    pub note_path: String,
    /// Notes shorter than this (after stripping comments and headings) count as empty.
    #[serde(default = "default_min_note_length")]
    pub min_note_length: usize,
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_note_path() -> String {
    "HEARTBEAT.md".into()
}
fn default_min_note_length() -> usize {
    10
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_heartbeat_interval(),
            active_hours: None,
            suppress_ok: true,
            channel: None,
            chat_id: None,
            delivery: DeliveryMode::Channel,
            note_path: default_note_path(),
            min_note_length: default_min_note_length(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentConfig {
    #[serde(default = "default_subagent_timeout")]
    pub default_timeout_minutes: u32,
    /// Terminal requests older than this are pruned by the sweep.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_result_cap")]
    pub result_cap_chars: usize,
}

fn default_subagent_timeout() -> u32 {
    30
}
fn default_retention_hours() -> u32 {
    24
}
fn default_max_concurrent() -> usize {
    5
}
fn default_result_cap() -> usize {
    crate::store::subagents::DEFAULT_RESULT_CAP
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: default_subagent_timeout(),
            retention_hours: default_retention_hours(),
            max_concurrent: default_max_concurrent(),
            result_cap_chars: default_result_cap(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub schedules: Vec<ScheduleDefinition>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub subagents: SubAgentConfig,
}

fn default_workspace() -> String {
    "~/.synward/workspace".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            log: LogConfig::default(),
            sandbox: SandboxConfig::default(),
            schedules: Vec::new(),
            scheduler: SchedulerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            subagents: SubAgentConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths & loading
// ---------------------------------------------------------------------------

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".synward")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(rest)
    } else if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(raw)
    }
}

pub fn workspace_path(cfg: &Config) -> PathBuf {
    expand_home(&cfg.workspace)
}

pub fn log_dir_path(cfg: &LogConfig) -> PathBuf {
    match &cfg.dir {
        Some(dir) => expand_home(dir),
        None => config_dir().join("logs"),
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if p.exists() {
        let text = std::fs::read_to_string(&p)
            .with_context(|| format!("reading config from {}", p.display()))?;
        let cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config from {}", p.display()))?;
        Ok(cfg)
    } else {
        Ok(Config::default())
    }
}

/// Write `cfg` atomically (temp file, then rename).
pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(cfg)?;
    let tmp = p.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &p).with_context(|| format!("replacing {}", p.display()))?;
    Ok(())
}
