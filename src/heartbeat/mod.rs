//! Heartbeat: periodic, cheap-to-skip agent wake-up.
//!
//! Each tick runs two free checks before spending anything on the agent: the
//! active-hours window, then whether there is any work at all (a non-empty
//! `HEARTBEAT.md` or an active task). Every tick that gets to a decision
//! appends exactly one [`HeartbeatEvent`].

pub mod active_hours;
pub mod events;

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentInvoker, InvocationContext, InvocationOrigin};
use crate::config::HeartbeatConfig;
use crate::delivery::{Deliverer, DeliveryTarget};
use crate::sandbox::{fs, AccessMode, PathSandbox};
use crate::store::tasks::{summarize, Task};
use crate::store::TaskStore;

pub use active_hours::ActiveHours;
pub use events::{HeartbeatEvent, HeartbeatLog, HeartbeatOutcome};

/// Reply token meaning "nothing needed attention". Matched case-insensitively.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Longest heartbeat period accepted from config: one week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub active_hours: Option<ActiveHours>,
    pub suppress_ok: bool,
    pub target: DeliveryTarget,
    /// Workspace-relative path of the heartbeat note.
    pub note_path: String,
    pub min_note_length: usize,
}

impl HeartbeatSettings {
    pub fn from_config(cfg: &HeartbeatConfig) -> Self {
        Self {
            interval: Duration::from_secs(
                cfg.interval_minutes
                    .clamp(1, MAX_INTERVAL_MINUTES)
                    .saturating_mul(60),
            ),
            active_hours: ActiveHours::from_config(cfg.active_hours.as_deref()),
            suppress_ok: cfg.suppress_ok,
            target: DeliveryTarget {
                mode: cfg.delivery,
                channel: cfg.channel.clone(),
                chat_id: cfg.chat_id.clone(),
            },
            note_path: cfg.note_path.clone(),
            min_note_length: cfg.min_note_length,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self::from_config(&HeartbeatConfig::default())
    }
}

/// Note text with headings, HTML comments, blank lines and empty list
/// markers removed. What is left is what the user actually asked for.
pub fn effective_note_content(note: &str) -> String {
    let mut out = Vec::new();
    let mut in_comment = false;
    for line in note.lines() {
        let mut rest = line;
        let mut kept = String::new();
        loop {
            if in_comment {
                match rest.find("-->") {
                    Some(end) => {
                        rest = &rest[end + 3..];
                        in_comment = false;
                    }
                    None => break,
                }
            } else {
                match rest.find("<!--") {
                    Some(start) => {
                        kept.push_str(&rest[..start]);
                        rest = &rest[start + 4..];
                        in_comment = true;
                    }
                    None => {
                        kept.push_str(rest);
                        break;
                    }
                }
            }
        }
        let t = kept.trim();
        if t.is_empty() || t.starts_with('#') || matches!(t, "-" | "*" | "- [ ]" | "* [ ]") {
            continue;
        }
        out.push(t.to_string());
    }
    out.join("\n")
}

pub fn note_is_empty(note: Option<&str>, min_length: usize) -> bool {
    match note {
        None => true,
        Some(text) => effective_note_content(text).chars().count() < min_length.max(1),
    }
}

pub fn contains_sentinel(reply: &str) -> bool {
    reply.to_ascii_uppercase().contains(HEARTBEAT_OK)
}

fn build_prompt(note: Option<&str>, active: &[Task], now: DateTime<Local>) -> String {
    let note = note
        .map(effective_note_content)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "(empty)".to_string());
    format!(
        "Heartbeat check at {}.\n\n\
         ## HEARTBEAT.md\n{}\n\n\
         ## Active tasks\n{}\n\n\
         Work through anything above that needs attention. \
         If nothing needs attention, reply with just: {}",
        now.format("%Y-%m-%d %H:%M %Z"),
        note,
        summarize(active, now.with_timezone(&Utc)),
        HEARTBEAT_OK
    )
}

pub struct HeartbeatEvaluator {
    settings: HeartbeatSettings,
    sandbox: PathSandbox,
    tasks: Arc<TaskStore>,
    invoker: Arc<dyn AgentInvoker>,
    deliverer: Arc<Deliverer>,
    log: Arc<HeartbeatLog>,
}

impl HeartbeatEvaluator {
    pub fn new(
        settings: HeartbeatSettings,
        sandbox: PathSandbox,
        tasks: Arc<TaskStore>,
        invoker: Arc<dyn AgentInvoker>,
        deliverer: Arc<Deliverer>,
        log: Arc<HeartbeatLog>,
    ) -> Self {
        Self {
            settings,
            sandbox,
            tasks,
            invoker,
            deliverer,
            log,
        }
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    pub fn log(&self) -> &Arc<HeartbeatLog> {
        &self.log
    }

    /// Evaluate once, now.
    pub async fn tick(&self) -> HeartbeatEvent {
        self.tick_at(Local::now()).await
    }

    /// Evaluate once as if the local time were `now`.
    pub async fn tick_at(&self, now: DateTime<Local>) -> HeartbeatEvent {
        let event = self.evaluate(now).await;
        if let Err(e) = self.log.append(&event).await {
            warn!(error = %e, "Failed to record heartbeat event");
        }
        event
    }

    async fn evaluate(&self, now: DateTime<Local>) -> HeartbeatEvent {
        let started = Instant::now();

        if let Some(hours) = &self.settings.active_hours {
            if !hours.contains(now.time()) {
                debug!(window = %hours, "Heartbeat outside active hours");
                return HeartbeatEvent::skipped(events::OUTSIDE_ACTIVE_HOURS);
            }
        }

        let note = self.read_note().await;
        let active = self.tasks.list_active().await;
        if active.is_empty() && note_is_empty(note.as_deref(), self.settings.min_note_length) {
            debug!("Heartbeat has no work");
            let mut event = HeartbeatEvent::skipped(events::NO_WORK);
            event.active_tasks = Some(0);
            return event;
        }

        let now_utc = now.with_timezone(&Utc);
        let due: Vec<String> = active
            .iter()
            .filter(|t| t.is_check_due(now_utc))
            .map(|t| t.id.clone())
            .collect();
        let prompt = build_prompt(note.as_deref(), &active, now);
        let target = &self.settings.target;
        let ctx = InvocationContext::new(InvocationOrigin::Heartbeat)
            .with_route(target.channel.clone(), target.chat_id.clone());

        let reply = match self.invoker.invoke(&ctx, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "Heartbeat invocation failed");
                let mut event = HeartbeatEvent::new(HeartbeatOutcome::Error);
                event.active_tasks = Some(active.len());
                event.duration_ms = Some(started.elapsed().as_millis() as u64);
                event.error = Some(format!("{e:#}"));
                return event;
            }
        };

        if !due.is_empty() {
            if let Err(e) = self.tasks.record_check(&due, now_utc).await {
                warn!(error = %e, "Failed to record task checks");
            }
        }

        let ok = contains_sentinel(&reply.text);
        let mut event = HeartbeatEvent::new(if ok {
            HeartbeatOutcome::HeartbeatOk
        } else {
            HeartbeatOutcome::Ran
        });
        event.active_tasks = Some(active.len());
        event.input_tokens = Some(reply.metrics.input_tokens);
        event.output_tokens = Some(reply.metrics.output_tokens);

        if ok && self.settings.suppress_ok {
            debug!("Heartbeat OK, delivery suppressed");
        } else {
            let report = self.deliverer.deliver("heartbeat", target, &reply.text).await;
            event.delivered = report.channel_sent || report.agent_injected;
            event.error = report.error_summary();
        }
        event.duration_ms = Some(started.elapsed().as_millis() as u64);
        info!(
            outcome = ?event.outcome,
            active_tasks = active.len(),
            delivered = event.delivered,
            "Heartbeat ran"
        );
        event
    }

    /// The note's text, or `None` when it is missing or unreadable.
    async fn read_note(&self) -> Option<String> {
        let path = match self.sandbox.resolve(&self.settings.note_path, AccessMode::Read) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Heartbeat note path rejected");
                return None;
            }
        };
        match fs::read_to_string(self.sandbox.root(), &path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(note = %self.settings.note_path, error = %e, "Heartbeat note unreadable");
                None
            }
        }
    }

    /// Tick every `interval` until the task is aborted. The first tick comes
    /// one interval after start.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            "Heartbeat started"
        );
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately, skip it
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}
