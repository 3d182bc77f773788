//! Result delivery shared by scheduled firings, heartbeat runs and sub-agent
//! notifications.
//!
//! `channel` sends the text to a [`Messenger`]; `agent` feeds it back into the
//! agent's own inbound queue as a system message, truncated to a character
//! limit with the full text spilled under `outputs/`; `both` does each
//! independently, so one failing leg never blocks the other.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{InboundMessage, Messenger};
use crate::sandbox::{fs, AccessMode, PathSandbox};

/// Default character limit for text injected back into the agent.
pub const DEFAULT_AGENT_OUTPUT_LIMIT: usize = 2000;

/// Workspace-relative directory receiving full copies of truncated output.
pub const OUTPUTS_DIR: &str = "outputs";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Channel,
    Agent,
    Both,
}

impl DeliveryMode {
    pub fn to_channel(self) -> bool {
        matches!(self, DeliveryMode::Channel | DeliveryMode::Both)
    }

    pub fn to_agent(self) -> bool {
        matches!(self, DeliveryMode::Agent | DeliveryMode::Both)
    }
}

/// Where a result goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub mode: DeliveryMode,
    pub channel: Option<String>,
    pub chat_id: Option<String>,
}

impl DeliveryTarget {
    pub fn session_key(&self) -> Option<String> {
        match (&self.channel, &self.chat_id) {
            (Some(ch), Some(chat)) => Some(format!("{ch}:{chat}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub channel_sent: bool,
    pub agent_injected: bool,
    pub truncated: bool,
    /// Workspace-relative path of the spilled full output, when truncated.
    pub full_output_path: Option<String>,
    pub errors: Vec<String>,
}

impl DeliveryReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}

/// Cut `text` to `limit` characters. Returns the kept prefix and whether
/// anything was dropped.
pub fn truncate_chars(text: &str, limit: usize) -> (&str, bool) {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => (&text[..byte_idx], true),
        None => (text, false),
    }
}

fn truncation_hint(limit: usize, full_path: Option<&str>) -> String {
    match full_path {
        Some(path) => format!(
            "\n\n[Output truncated at {limit} characters. Read full output at `{path}`]"
        ),
        None => format!(
            "\n\n[Output truncated at {limit} characters. The full output could not be saved]"
        ),
    }
}

/// Spill file name stem: `<source>-<timestamp>`, with the source reduced to
/// characters that are safe in a file name.
fn spill_stem(source: &str) -> String {
    let clean: String = source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let clean = if clean.is_empty() { "output".to_string() } else { clean };
    format!("{}-{}", clean, Utc::now().format("%Y%m%dT%H%M%S%3fZ"))
}

pub struct Deliverer {
    messengers: HashMap<String, Arc<dyn Messenger>>,
    inbox: mpsc::Sender<InboundMessage>,
    sandbox: PathSandbox,
    agent_output_limit: usize,
}

impl Deliverer {
    pub fn new(inbox: mpsc::Sender<InboundMessage>, sandbox: PathSandbox) -> Self {
        Self {
            messengers: HashMap::new(),
            inbox,
            sandbox,
            agent_output_limit: DEFAULT_AGENT_OUTPUT_LIMIT,
        }
    }

    pub fn with_agent_output_limit(mut self, limit: usize) -> Self {
        self.agent_output_limit = limit;
        self
    }

    pub fn agent_output_limit(&self) -> usize {
        self.agent_output_limit
    }

    /// Register a messenger under its channel name. Messengers whose
    /// capability probe fails are skipped; returns whether it was registered.
    pub fn register_messenger(&mut self, messenger: Arc<dyn Messenger>) -> bool {
        let channel = messenger.channel().to_string();
        if !messenger.is_available() {
            info!(channel = %channel, "Messenger unavailable, not registered");
            return false;
        }
        if self.messengers.insert(channel.clone(), messenger).is_some() {
            warn!(channel = %channel, "Messenger replaced an existing registration");
        }
        true
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.messengers.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.messengers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliver `text` produced by `source` according to `target.mode`.
    /// Failures are collected in the report, never raised.
    pub async fn deliver(&self, source: &str, target: &DeliveryTarget, text: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        if target.mode.to_channel() {
            match self.send_to_channel(target, text).await {
                Ok(()) => report.channel_sent = true,
                Err(e) => {
                    warn!(source = %source, error = %e, "Channel delivery failed");
                    report.errors.push(format!("channel: {e:#}"));
                }
            }
        }

        if target.mode.to_agent() {
            match self.inject_into_agent(source, target, text).await {
                Ok((truncated, path)) => {
                    report.agent_injected = true;
                    report.truncated = truncated;
                    report.full_output_path = path;
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Agent delivery failed");
                    report.errors.push(format!("agent: {e:#}"));
                }
            }
        }

        debug!(
            source = %source,
            mode = ?target.mode,
            channel_sent = report.channel_sent,
            agent_injected = report.agent_injected,
            truncated = report.truncated,
            "Delivery finished"
        );
        report
    }

    /// Send to the messenger registered for `target.channel`.
    pub async fn send_to_channel(&self, target: &DeliveryTarget, text: &str) -> Result<()> {
        let channel = target
            .channel
            .as_deref()
            .ok_or_else(|| anyhow!("no output channel configured"))?;
        let chat_id = target
            .chat_id
            .as_deref()
            .ok_or_else(|| anyhow!("no chat id configured for channel '{channel}'"))?;
        let messenger = self
            .messengers
            .get(channel)
            .ok_or_else(|| anyhow!("no messenger registered for channel '{channel}'"))?;
        let key = messenger.build_session_key(chat_id);
        messenger
            .send(&key, text)
            .await
            .with_context(|| format!("sending to {key}"))
    }

    async fn inject_into_agent(
        &self,
        source: &str,
        target: &DeliveryTarget,
        text: &str,
    ) -> Result<(bool, Option<String>)> {
        let limit = self.agent_output_limit;
        let (kept, truncated) = truncate_chars(text, limit);

        let mut content = kept.to_string();
        let mut full_path = None;
        if truncated {
            full_path = match self.spill(source, text).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(source = %source, error = %e, "Could not save full output");
                    None
                }
            };
            content.push_str(&truncation_hint(limit, full_path.as_deref()));
        }

        let chat_id = target.session_key().unwrap_or_else(|| source.to_string());
        let msg = InboundMessage::system(
            chat_id,
            content,
            json!({
                "source": source,
                "truncated": truncated,
                "full_output_path": full_path,
            }),
        );
        self.inbox
            .send(msg)
            .await
            .map_err(|_| anyhow!("agent inbox is closed"))?;
        Ok((truncated, full_path))
    }

    /// Write `text` to a fresh file under `outputs/`, returning its
    /// workspace-relative path.
    async fn spill(&self, source: &str, text: &str) -> Result<String> {
        let stem = spill_stem(source);
        let mut relative = format!("{OUTPUTS_DIR}/{stem}.md");
        let mut absolute = self.sandbox.resolve(&relative, AccessMode::Write)?;
        if let Err(e) = fs::write_new(self.sandbox.root(), &absolute, text.as_bytes()).await {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e).with_context(|| format!("writing {relative}"));
            }
            let short = uuid::Uuid::new_v4().simple().to_string();
            relative = format!("{OUTPUTS_DIR}/{stem}-{}.md", &short[..8]);
            absolute = self.sandbox.resolve(&relative, AccessMode::Write)?;
            fs::write_new(self.sandbox.root(), &absolute, text.as_bytes())
                .await
                .with_context(|| format!("writing {relative}"))?;
        }
        Ok(relative)
    }
}
