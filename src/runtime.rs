//! Composition root: wires stores, bus, delivery, scheduler, sub-agents,
//! heartbeat and tools over one workspace.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::subagent::{SubAgentManager, SubAgentSettings};
use crate::agent::AgentInvoker;
use crate::bus::{BusMessenger, InboundMessage, MessageBus, Messenger};
use crate::config::{workspace_path, Config};
use crate::cron::{ScheduleEngine, SchedulerLimits, StartupReport};
use crate::delivery::Deliverer;
use crate::heartbeat::{HeartbeatEvaluator, HeartbeatLog, HeartbeatSettings};
use crate::sandbox::PathSandbox;
use crate::store::subagents::SweepReport;
use crate::store::{DynamicScheduleStore, SubAgentStore, TaskStore};
use crate::tools::{filesystem, schedule, spawn, tasks, DynTool, ToolRegistry};

pub struct Runtime {
    config: Config,
    workspace: PathBuf,
    sandbox: PathSandbox,
    bus: MessageBus,
    tasks: Arc<TaskStore>,
    deliverer: Arc<Deliverer>,
    scheduler: ScheduleEngine,
    subagents: Arc<SubAgentManager>,
    heartbeat: Arc<HeartbeatEvaluator>,
    heartbeat_handle: Option<JoinHandle<()>>,
    tools: Arc<ToolRegistry>,
    schedule_report: StartupReport,
    sweep_report: SweepReport,
}

impl Runtime {
    /// Build everything over `config`'s workspace and run startup maintenance.
    ///
    /// Messengers that fail their capability probe are skipped. Channels named
    /// in the config without a messenger get a [`BusMessenger`], so their
    /// output reaches whatever adapter subscribes to the bus.
    pub async fn start(
        config: Config,
        invoker: Arc<dyn AgentInvoker>,
        messengers: Vec<Arc<dyn Messenger>>,
    ) -> Result<Self> {
        let workspace = workspace_path(&config);
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("creating workspace {}", workspace.display()))?;
        let sandbox = PathSandbox::from_config(&workspace, &config.sandbox);

        let tasks = Arc::new(TaskStore::in_workspace(&workspace));
        let schedules = Arc::new(DynamicScheduleStore::in_workspace(&workspace));
        let subagent_store = Arc::new(
            SubAgentStore::in_workspace(&workspace).with_result_cap(config.subagents.result_cap_chars),
        );

        let bus = MessageBus::new();
        let mut deliverer = Deliverer::new(bus.inbound_sender(), sandbox.clone())
            .with_agent_output_limit(config.scheduler.agent_output_limit);
        for messenger in messengers {
            deliverer.register_messenger(messenger);
        }
        for channel in configured_channels(&config) {
            if !deliverer.has_channel(&channel) {
                info!(channel = %channel, "No messenger for configured channel, routing via bus");
                deliverer.register_messenger(BusMessenger::shared(channel, &bus));
            }
        }
        let deliverer = Arc::new(deliverer);

        let scheduler = ScheduleEngine::new(
            schedules,
            Arc::clone(&invoker),
            Arc::clone(&deliverer),
            SchedulerLimits::from(&config.scheduler),
        );
        let schedule_report = scheduler.start(config.schedules.clone()).await?;

        let subagents = Arc::new(
            SubAgentManager::new(
                subagent_store,
                Arc::clone(&invoker),
                SubAgentSettings {
                    default_timeout_minutes: config.subagents.default_timeout_minutes,
                    retention: chrono::Duration::hours(i64::from(config.subagents.retention_hours)),
                    max_concurrent: config.subagents.max_concurrent,
                },
            )
            .with_deliverer(Arc::clone(&deliverer)),
        );
        let sweep_report = subagents.initialize().await?;

        let heartbeat = Arc::new(HeartbeatEvaluator::new(
            HeartbeatSettings::from_config(&config.heartbeat),
            sandbox.clone(),
            Arc::clone(&tasks),
            invoker,
            Arc::clone(&deliverer),
            Arc::new(HeartbeatLog::in_workspace(&workspace)),
        ));
        let heartbeat_handle = config.heartbeat.enabled.then(|| {
            let hb = Arc::clone(&heartbeat);
            tokio::spawn(async move {
                if let Err(e) = hb.run().await {
                    error!("Heartbeat error: {e:#}");
                }
            })
        });

        let tools = Arc::new(build_tools(&sandbox, &scheduler, &subagents, &tasks)?);

        info!(
            workspace = %workspace.display(),
            channels = ?deliverer.channels(),
            tools = tools.names().len(),
            heartbeat = config.heartbeat.enabled,
            "Runtime started"
        );

        Ok(Self {
            config,
            workspace,
            sandbox,
            bus,
            tasks,
            deliverer,
            scheduler,
            subagents,
            heartbeat,
            heartbeat_handle,
            tools,
            schedule_report,
            sweep_report,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The agent's inbound queue (system messages from agent-mode delivery).
    /// Available once.
    pub fn take_inbound_receiver(&mut self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.bus.take_inbound_receiver()
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn deliverer(&self) -> &Arc<Deliverer> {
        &self.deliverer
    }

    pub fn scheduler(&self) -> &ScheduleEngine {
        &self.scheduler
    }

    pub fn subagents(&self) -> &Arc<SubAgentManager> {
        &self.subagents
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatEvaluator> {
        &self.heartbeat
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn schedule_report(&self) -> StartupReport {
        self.schedule_report
    }

    pub fn sweep_report(&self) -> SweepReport {
        self.sweep_report
    }

    /// Stop timers, supervisors and the heartbeat loop. Invocations already
    /// running are left to finish on their own.
    pub async fn shutdown(&mut self) {
        self.scheduler.shutdown().await;
        self.subagents.shutdown().await;
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
        info!("Runtime stopped");
    }
}

/// Channels referenced by static schedules or the heartbeat.
fn configured_channels(config: &Config) -> BTreeSet<String> {
    config
        .schedules
        .iter()
        .filter_map(|s| s.channel.clone())
        .chain(config.heartbeat.channel.clone())
        .filter(|c| !c.trim().is_empty())
        .collect()
}

fn build_tools(
    sandbox: &PathSandbox,
    scheduler: &ScheduleEngine,
    subagents: &Arc<SubAgentManager>,
    task_store: &Arc<TaskStore>,
) -> Result<ToolRegistry> {
    let all: Vec<Arc<dyn DynTool>> = vec![
        Arc::new(filesystem::ReadFileTool { sandbox: sandbox.clone() }),
        Arc::new(filesystem::WriteFileTool { sandbox: sandbox.clone() }),
        Arc::new(filesystem::ListDirTool { sandbox: sandbox.clone() }),
        Arc::new(schedule::ScheduleAtTool { engine: scheduler.clone() }),
        Arc::new(schedule::ScheduleEveryTool { engine: scheduler.clone() }),
        Arc::new(schedule::ListScheduledTasksTool { engine: scheduler.clone() }),
        Arc::new(schedule::CancelScheduledTaskTool { engine: scheduler.clone() }),
        Arc::new(spawn::SpawnSubAgentTool { manager: Arc::clone(subagents) }),
        Arc::new(spawn::SubAgentStatusTool { manager: Arc::clone(subagents) }),
        Arc::new(spawn::CancelSubAgentTool { manager: Arc::clone(subagents) }),
        Arc::new(tasks::CreateTaskTool { store: Arc::clone(task_store) }),
        Arc::new(tasks::UpdateTaskTool { store: Arc::clone(task_store) }),
        Arc::new(tasks::ListTasksTool { store: Arc::clone(task_store) }),
    ];
    let mut reg = ToolRegistry::new();
    for tool in all {
        let name = tool.name().to_string();
        if !reg.register_available(tool)? {
            warn!(tool_name = %name, "Tool not registered");
        }
    }
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::ScheduleDefinition;

    #[test]
    fn configured_channels_are_deduplicated() {
        let mut cfg = Config::default();
        for (name, channel) in [("a", Some("telegram")), ("b", Some("telegram")), ("c", None), ("d", Some(" "))] {
            cfg.schedules.push(ScheduleDefinition {
                name: name.into(),
                cron: "0 9 * * *".into(),
                prompt: "hi".into(),
                delivery: Default::default(),
                channel: channel.map(str::to_string),
                chat_id: None,
                enabled: true,
            });
        }
        cfg.heartbeat.channel = Some("discord".into());
        let channels: Vec<String> = configured_channels(&cfg).into_iter().collect();
        assert_eq!(channels, vec!["discord".to_string(), "telegram".to_string()]);
    }
}
