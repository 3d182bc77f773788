//! # Synward - workspace state and scheduling core for a personal AI agent
//!
//! Synward owns the parts of an agent runtime that outlive a single
//! conversation: timers the agent sets for itself, background sub-agents,
//! a periodic heartbeat, tracked tasks, and the sandbox every file access
//! goes through. The language model, channel adapters and the agent loop are
//! supplied by the embedding application through [`agent::AgentInvoker`] and
//! [`bus::Messenger`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use synward::agent::{AgentInvoker, AgentReply, InvocationContext};
//! use synward::config;
//! use synward::runtime::Runtime;
//!
//! struct MyAgent;
//!
//! #[async_trait::async_trait]
//! impl AgentInvoker for MyAgent {
//!     async fn invoke(&self, _ctx: &InvocationContext, prompt: &str) -> anyhow::Result<AgentReply> {
//!         Ok(AgentReply::text(format!("echo: {prompt}")))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = config::load_config(None)?;
//!     let _guard = synward::logging::init_logging(&cfg.log)?;
//!     let mut runtime = Runtime::start(cfg, Arc::new(MyAgent), Vec::new()).await?;
//!     let Some(mut inbox) = runtime.take_inbound_receiver() else {
//!         anyhow::bail!("inbox already taken");
//!     };
//!     while let Some(msg) = inbox.recv().await {
//!         println!("{}: {}", msg.session_key(), msg.content);
//!     }
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`sandbox`] - workspace path resolution with protected directories
//! - [`store`] - atomic JSON stores for tasks, sub-agents and dynamic schedules
//! - [`cron`] - static cron schedules and agent-created timers
//! - [`heartbeat`] - periodic wake-up with cheap skip checks and an event log
//! - [`agent`] - invocation interfaces and the sub-agent manager
//! - [`delivery`] - routing results to channels or back into the agent
//! - [`bus`] - in-process message bus and the messenger interface
//! - [`tools`] - the tool surface exposed to the agent
//! - [`runtime`] - composition root

pub mod agent;
pub mod bus;
pub mod config;
pub mod cron;
pub mod delivery;
pub mod heartbeat;
pub mod logging;
pub mod runtime;
pub mod sandbox;
pub mod store;
pub mod tools;
