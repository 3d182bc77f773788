//! Timed invocations: static cron schedules and agent-created tasks.

pub mod config_runner;
pub mod service;
pub mod types;

pub use service::{FiringOutcome, ScheduleEngine, ScheduleError, SchedulerLimits, StartupReport, TaskRoute};
pub use types::{DynamicScheduleTask, ScheduleDefinition, ScheduleKind, TimerState, TimerStatus};
