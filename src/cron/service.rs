//! Schedule engine: owns every live timer, static and dynamic.
//!
//! Static schedules come from configuration and follow a cron expression.
//! Dynamic tasks are created by the agent at runtime (`once` or `interval`)
//! and persisted in the [`DynamicScheduleStore`]. The persisted set and the
//! live timer set change together under one lock, always taken before the
//! store's own lock.
//!
//! A timer loop never runs a firing inline: each firing is its own task, so
//! aborting the loop (cancel, disable, shutdown) stops future firings without
//! interrupting one already in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{
    race_deadline, spawn_invocation, AgentInvoker, InvocationContext, InvocationOrigin, RaceOutcome,
};
use crate::config::SchedulerConfig;
use crate::cron::config_runner::{
    add_seconds, delay_until, next_interval_after, next_run_after, parse_schedule,
};
use crate::cron::types::{
    DynamicScheduleTask, ScheduleDefinition, ScheduleKind, TimerSource, TimerState, TimerStatus,
};
use crate::delivery::{Deliverer, DeliveryMode, DeliveryReport, DeliveryTarget};
use crate::store::DynamicScheduleStore;

#[derive(Debug, Clone)]
pub struct SchedulerLimits {
    pub max_tasks: usize,
    pub min_interval_seconds: u64,
    /// Deadline for one firing's invocation. A miss counts as a failed firing.
    pub invocation_timeout: Option<Duration>,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerLimits {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            max_tasks: cfg.max_tasks,
            min_interval_seconds: cfg.min_interval_seconds,
            invocation_timeout: cfg.invocation_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Maximum task limit reached ({max}). Cancel existing tasks first with cancel_scheduled_task")]
    TaskLimit { max: usize },

    #[error("Interval of {requested}s is below the minimum of {min}s. Use an interval of at least {min} seconds")]
    IntervalTooShort { requested: u64, min: u64 },

    #[error("run_at {run_at} is not in the future (now is {now}). Pick a later time")]
    NotInFuture { run_at: DateTime<Utc>, now: DateTime<Utc> },

    #[error("{field} of {requested}s is out of range. Use a smaller value")]
    OutOfRange { field: &'static str, requested: String },

    #[error("unknown scheduled task '{0}'")]
    TaskNotFound(String),

    #[error("unknown schedule '{0}'")]
    ScheduleNotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Where a dynamic task reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRoute {
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub delivery: DeliveryMode,
}

/// Result of one firing.
#[derive(Debug, Clone)]
pub struct FiringOutcome {
    pub key: String,
    pub reply: Option<String>,
    pub delivery: Option<DeliveryReport>,
    pub error: Option<String>,
}

impl FiringOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub static_registered: usize,
    pub static_skipped: usize,
    pub dynamic_registered: usize,
    pub dynamic_pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Static(String),
    Dynamic(String),
}

impl TimerKey {
    fn name(&self) -> &str {
        match self {
            TimerKey::Static(n) | TimerKey::Dynamic(n) => n,
        }
    }
}

struct TimerSlot {
    status: TimerStatus,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct StaticTimer {
    def: ScheduleDefinition,
    schedule: cron::Schedule,
    slot: TimerSlot,
}

#[derive(Default)]
struct Timers {
    statics: HashMap<String, StaticTimer>,
    dynamics: HashMap<String, TimerSlot>,
}

impl Timers {
    fn status_mut(&mut self, key: &TimerKey) -> Option<&mut TimerStatus> {
        match key {
            TimerKey::Static(name) => self.statics.get_mut(name).map(|t| &mut t.slot.status),
            TimerKey::Dynamic(id) => self.dynamics.get_mut(id).map(|s| &mut s.status),
        }
    }
}

struct Inner {
    store: Arc<DynamicScheduleStore>,
    invoker: Arc<dyn AgentInvoker>,
    deliverer: Arc<Deliverer>,
    limits: SchedulerLimits,
    timers: Mutex<Timers>,
}

#[derive(Clone)]
pub struct ScheduleEngine {
    inner: Arc<Inner>,
}

impl ScheduleEngine {
    pub fn new(
        store: Arc<DynamicScheduleStore>,
        invoker: Arc<dyn AgentInvoker>,
        deliverer: Arc<Deliverer>,
        limits: SchedulerLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                invoker,
                deliverer,
                limits,
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<DynamicScheduleStore> {
        &self.inner.store
    }

    /// Register static schedules, prune expired one-shots, then register the
    /// remaining dynamic tasks.
    pub async fn start(&self, definitions: Vec<ScheduleDefinition>) -> anyhow::Result<StartupReport> {
        let mut report = StartupReport::default();
        let mut timers = self.inner.timers.lock().await;

        for def in definitions {
            let schedule = match parse_schedule(&def.cron) {
                Ok(s) => s,
                Err(e) => {
                    warn!(schedule = %def.name, error = %e, "Invalid cron expression, schedule skipped");
                    report.static_skipped += 1;
                    continue;
                }
            };
            if timers.statics.contains_key(&def.name) {
                warn!(schedule = %def.name, "Duplicate schedule name, later definition ignored");
                report.static_skipped += 1;
                continue;
            }
            let next = next_run_after(&schedule, Utc::now());
            let handle = if def.enabled {
                report.static_registered += 1;
                Some(self.spawn_static_loop(def.name.clone(), schedule.clone()))
            } else {
                debug!(schedule = %def.name, "Schedule disabled");
                report.static_skipped += 1;
                None
            };
            let name = def.name.clone();
            timers.statics.insert(
                name.clone(),
                StaticTimer {
                    def,
                    schedule,
                    slot: TimerSlot {
                        status: TimerStatus::new(name, TimerSource::Static, next),
                        handle,
                    },
                },
            );
        }

        let now = Utc::now();
        for task in self.inner.store.prune_expired(now).await? {
            info!(task_id = %task.id, run_at = %task.next_fire(), "Pruned expired one-shot task");
            report.dynamic_pruned += 1;
        }
        for task in self.inner.store.list().await {
            if timers.dynamics.contains_key(&task.id) {
                continue;
            }
            let slot = self.dynamic_slot(&task);
            timers.dynamics.insert(task.id.clone(), slot);
            report.dynamic_registered += 1;
        }

        info!(
            static_registered = report.static_registered,
            static_skipped = report.static_skipped,
            dynamic_registered = report.dynamic_registered,
            dynamic_pruned = report.dynamic_pruned,
            "Schedule engine started"
        );
        Ok(report)
    }

    /// Create a one-shot task firing at `run_at`, which must be in the future.
    pub async fn schedule_at(
        &self,
        prompt: impl Into<String>,
        run_at: DateTime<Utc>,
        route: TaskRoute,
    ) -> Result<DynamicScheduleTask, ScheduleError> {
        let mut timers = self.inner.timers.lock().await;
        self.check_capacity().await?;
        let now = Utc::now();
        if run_at <= now {
            return Err(ScheduleError::NotInFuture { run_at, now });
        }
        let task = new_task(ScheduleKind::Once { run_at }, prompt.into(), route);
        self.admit(&mut timers, task).await
    }

    /// Create a repeating task, first firing one interval from now.
    pub async fn schedule_every(
        &self,
        prompt: impl Into<String>,
        interval_seconds: u64,
        route: TaskRoute,
    ) -> Result<DynamicScheduleTask, ScheduleError> {
        let mut timers = self.inner.timers.lock().await;
        self.check_capacity().await?;
        let min = self.inner.limits.min_interval_seconds;
        if interval_seconds < min || interval_seconds == 0 {
            return Err(ScheduleError::IntervalTooShort {
                requested: interval_seconds,
                min: min.max(1),
            });
        }
        let next_run = i64::try_from(interval_seconds)
            .ok()
            .and_then(|secs| add_seconds(Utc::now(), secs))
            .ok_or_else(|| ScheduleError::OutOfRange {
                field: "interval_seconds",
                requested: interval_seconds.to_string(),
            })?;
        let task = new_task(
            ScheduleKind::Interval {
                interval_seconds,
                next_run,
            },
            prompt.into(),
            route,
        );
        self.admit(&mut timers, task).await
    }

    async fn check_capacity(&self) -> Result<(), ScheduleError> {
        let max = self.inner.limits.max_tasks;
        if self.inner.store.list().await.len() >= max {
            return Err(ScheduleError::TaskLimit { max });
        }
        Ok(())
    }

    async fn admit(
        &self,
        timers: &mut Timers,
        mut task: DynamicScheduleTask,
    ) -> Result<DynamicScheduleTask, ScheduleError> {
        while timers.dynamics.contains_key(&task.id) || self.inner.store.get(&task.id).await.is_some() {
            debug!(task_id = %task.id, "Task id already taken, drawing another");
            task.id = new_task_id();
        }
        self.inner.store.add(task.clone()).await?;
        let slot = self.dynamic_slot(&task);
        if let Some(mut replaced) = timers.dynamics.insert(task.id.clone(), slot) {
            replaced.stop();
        }
        info!(task_id = %task.id, next_fire = %task.next_fire(), once = task.is_once(), "Scheduled task created");
        Ok(task)
    }

    /// Remove a dynamic task's timer and its persisted record together. A
    /// firing already in progress still completes and delivers.
    pub async fn cancel(&self, id: &str) -> Result<DynamicScheduleTask, ScheduleError> {
        let mut timers = self.inner.timers.lock().await;
        let task = self
            .inner
            .store
            .get(id)
            .await
            .ok_or_else(|| ScheduleError::TaskNotFound(id.to_string()))?;
        if let Some(mut slot) = timers.dynamics.remove(id) {
            slot.stop();
        }
        self.inner.store.remove(id).await?;
        info!(task_id = %id, "Scheduled task cancelled");
        Ok(task)
    }

    pub async fn list_dynamic(&self) -> Vec<DynamicScheduleTask> {
        self.inner.store.list().await
    }

    /// Live timers: enabled static schedules plus every dynamic task.
    pub async fn list_timers(&self) -> Vec<TimerStatus> {
        let timers = self.inner.timers.lock().await;
        let mut out: Vec<TimerStatus> = timers
            .statics
            .values()
            .filter(|t| t.slot.handle.is_some())
            .map(|t| t.slot.status.clone())
            .chain(timers.dynamics.values().map(|s| s.status.clone()))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub async fn definitions(&self) -> Vec<ScheduleDefinition> {
        let timers = self.inner.timers.lock().await;
        let mut defs: Vec<ScheduleDefinition> =
            timers.statics.values().map(|t| t.def.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run static schedule `name` right now, enabled or not.
    pub async fn fire_now(&self, name: &str) -> Result<FiringOutcome, ScheduleError> {
        let def = {
            let timers = self.inner.timers.lock().await;
            timers
                .statics
                .get(name)
                .map(|t| t.def.clone())
                .ok_or_else(|| ScheduleError::ScheduleNotFound(name.to_string()))?
        };
        Ok(fire_static(Arc::clone(&self.inner), def).await)
    }

    /// Enable or disable static schedule `name`. Returns the previous state.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, ScheduleError> {
        let mut timers = self.inner.timers.lock().await;
        let timer = timers
            .statics
            .get_mut(name)
            .ok_or_else(|| ScheduleError::ScheduleNotFound(name.to_string()))?;
        let previous = timer.def.enabled;
        timer.def.enabled = enabled;
        if enabled && timer.slot.handle.is_none() {
            timer.slot.status.state = TimerState::Registered;
            timer.slot.handle = Some(self.spawn_static_loop(name.to_string(), timer.schedule.clone()));
        } else if !enabled {
            timer.slot.stop();
        }
        info!(schedule = %name, enabled, "Schedule toggled");
        Ok(previous)
    }

    /// Stop every timer loop. In-flight firings run to completion.
    pub async fn shutdown(&self) {
        let mut timers = self.inner.timers.lock().await;
        for timer in timers.statics.values_mut() {
            timer.slot.stop();
        }
        for slot in timers.dynamics.values_mut() {
            slot.stop();
        }
        info!("Schedule engine stopped");
    }

    fn spawn_static_loop(&self, name: String, schedule: cron::Schedule) -> JoinHandle<()> {
        tokio::spawn(run_static(Arc::clone(&self.inner), name, schedule))
    }

    fn dynamic_slot(&self, task: &DynamicScheduleTask) -> TimerSlot {
        let source = if task.is_once() {
            TimerSource::Once
        } else {
            TimerSource::Interval
        };
        let handle = tokio::spawn(run_dynamic(Arc::clone(&self.inner), task.clone()));
        TimerSlot {
            status: TimerStatus::new(task.id.clone(), source, Some(task.next_fire())),
            handle: Some(handle),
        }
    }
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn new_task(kind: ScheduleKind, prompt: String, route: TaskRoute) -> DynamicScheduleTask {
    DynamicScheduleTask {
        id: new_task_id(),
        kind,
        prompt,
        created_at: Utc::now(),
        channel: route.channel,
        chat_id: route.chat_id,
        delivery: route.delivery,
    }
}

impl Inner {
    async fn update_status(&self, key: &TimerKey, f: impl FnOnce(&mut TimerStatus)) {
        let mut timers = self.timers.lock().await;
        if let Some(status) = timers.status_mut(key) {
            f(status);
        }
    }
}

async fn run_static(inner: Arc<Inner>, name: String, schedule: cron::Schedule) {
    let key = TimerKey::Static(name.clone());
    loop {
        let now = Utc::now();
        let Some(next) = next_run_after(&schedule, now) else {
            warn!(schedule = %name, "Cron expression has no upcoming run, timer stopped");
            return;
        };
        inner
            .update_status(&key, |s| {
                s.state = TimerState::Registered;
                s.next_fire = Some(next);
            })
            .await;
        tokio::time::sleep(delay_until(next, now)).await;

        let def = {
            let timers = inner.timers.lock().await;
            match timers.statics.get(&name) {
                Some(t) if t.def.enabled => t.def.clone(),
                _ => return,
            }
        };
        let firing = tokio::spawn(fire_static(Arc::clone(&inner), def));
        if let Err(e) = firing.await {
            error!(schedule = %name, error = %e, "Firing task crashed");
        }
    }
}

async fn run_dynamic(inner: Arc<Inner>, task: DynamicScheduleTask) {
    let key = TimerKey::Dynamic(task.id.clone());
    match task.kind {
        ScheduleKind::Once { run_at } => {
            tokio::time::sleep(delay_until(run_at, Utc::now())).await;
            let firing = tokio::spawn(fire_once(Arc::clone(&inner), task));
            if let Err(e) = firing.await {
                error!(task_id = %key.name(), error = %e, "Firing task crashed");
            }
        }
        ScheduleKind::Interval {
            interval_seconds,
            mut next_run,
        } => {
            loop {
                tokio::time::sleep(delay_until(next_run, Utc::now())).await;
                let firing = tokio::spawn(fire_dynamic(Arc::clone(&inner), task.clone()));
                if let Err(e) = firing.await {
                    error!(task_id = %task.id, error = %e, "Firing task crashed");
                }

                let Some(next) = next_interval_after(next_run, interval_seconds, Utc::now()) else {
                    error!(task_id = %task.id, interval_seconds, "Next run out of range, timer stopped");
                    return;
                };
                next_run = next;
                match inner.store.set_next_run(&task.id, next_run).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(task_id = %task.id, "Interval task gone, timer stopped");
                        return;
                    }
                    Err(e) => warn!(task_id = %task.id, error = %e, "Failed to persist next run"),
                }
                inner
                    .update_status(&key, |s| {
                        s.state = TimerState::Registered;
                        s.next_fire = Some(next_run);
                    })
                    .await;
            }
        }
    }
}

async fn fire_static(inner: Arc<Inner>, def: ScheduleDefinition) -> FiringOutcome {
    let ctx = InvocationContext::new(InvocationOrigin::Schedule {
        name: def.name.clone(),
    })
    .with_route(def.channel.clone(), def.chat_id.clone());
    let key = TimerKey::Static(def.name.clone());
    fire(&inner, &key, &def.name, ctx, def.prompt.clone(), def.target()).await
}

async fn fire_dynamic(inner: Arc<Inner>, task: DynamicScheduleTask) -> FiringOutcome {
    let ctx = InvocationContext::new(InvocationOrigin::DynamicTask {
        id: task.id.clone(),
    })
    .with_route(task.channel.clone(), task.chat_id.clone());
    let key = TimerKey::Dynamic(task.id.clone());
    let source = format!("task-{}", task.id);
    fire(&inner, &key, &source, ctx, task.prompt.clone(), task.target()).await
}

/// Fire a one-shot task, then drop it from the timers and the store whatever
/// the outcome.
async fn fire_once(inner: Arc<Inner>, task: DynamicScheduleTask) -> FiringOutcome {
    let id = task.id.clone();
    let outcome = fire_dynamic(Arc::clone(&inner), task).await;
    let mut timers = inner.timers.lock().await;
    timers.dynamics.remove(&id);
    if let Err(e) = inner.store.remove(&id).await {
        warn!(task_id = %id, error = %e, "Failed to remove fired one-shot task");
    }
    outcome
}

async fn fire(
    inner: &Arc<Inner>,
    key: &TimerKey,
    source: &str,
    ctx: InvocationContext,
    prompt: String,
    target: DeliveryTarget,
) -> FiringOutcome {
    let fired_at = Utc::now();
    inner
        .update_status(key, |s| {
            s.state = TimerState::Firing;
            s.last_fired_at = Some(fired_at);
            s.fire_count += 1;
        })
        .await;
    info!(timer = %key.name(), "Timer firing");

    let handle = spawn_invocation(Arc::clone(&inner.invoker), ctx, prompt);
    let mut outcome = FiringOutcome {
        key: key.name().to_string(),
        reply: None,
        delivery: None,
        error: None,
    };
    match race_deadline(handle, inner.limits.invocation_timeout).await {
        RaceOutcome::Finished(Ok(reply)) => {
            let report = inner.deliverer.deliver(source, &target, &reply.text).await;
            outcome.error = report.error_summary();
            outcome.reply = Some(reply.text);
            outcome.delivery = Some(report);
        }
        RaceOutcome::Finished(Err(e)) => outcome.error = Some(format!("{e:#}")),
        RaceOutcome::Crashed(msg) => outcome.error = Some(msg),
        RaceOutcome::DeadlineElapsed => {
            let secs = inner.limits.invocation_timeout.map(|d| d.as_secs()).unwrap_or(0);
            outcome.error = Some(format!("invocation timed out after {secs}s"));
        }
    }

    match &outcome.error {
        None => info!(timer = %key.name(), "Timer firing completed"),
        Some(err) => error!(timer = %key.name(), error = %err, "Timer firing failed"),
    }
    let error = outcome.error.clone();
    inner
        .update_status(key, |s| {
            s.state = if error.is_some() {
                TimerState::Failed
            } else {
                TimerState::Completed
            };
            s.last_error = error;
        })
        .await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentReply;
    use crate::bus::{InboundMessage, Messenger};
    use crate::sandbox::PathSandbox;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AgentInvoker for Echo {
        async fn invoke(&self, _ctx: &InvocationContext, prompt: &str) -> anyhow::Result<AgentReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt == "fail" {
                anyhow::bail!("agent unavailable");
            }
            Ok(AgentReply::text(format!("re: {prompt}")))
        }
    }

    struct Sink {
        sent: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Messenger for Sink {
        fn channel(&self) -> &str {
            "telegram"
        }
        async fn send(&self, _key: &str, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        engine: ScheduleEngine,
        echo: Arc<Echo>,
        sink: Arc<Sink>,
        inbox: mpsc::Receiver<InboundMessage>,
    }

    fn fixture(limits: SchedulerLimits) -> Fixture {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        fixture_with_invoker(limits, echo.clone(), echo)
    }

    fn fixture_with_invoker(
        limits: SchedulerLimits,
        invoker: Arc<dyn AgentInvoker>,
        echo: Arc<Echo>,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (tx, inbox) = mpsc::channel(16);
        let sink = Arc::new(Sink {
            sent: Default::default(),
        });
        let mut deliverer = Deliverer::new(tx, PathSandbox::new(dir.path()));
        deliverer.register_messenger(sink.clone());
        let engine = ScheduleEngine::new(
            Arc::new(DynamicScheduleStore::in_workspace(dir.path())),
            invoker,
            Arc::new(deliverer),
            limits,
        );
        Fixture {
            _dir: dir,
            engine,
            echo,
            sink,
            inbox,
        }
    }

    /// Blocks every invocation until released.
    struct Gate {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl AgentInvoker for Gate {
        async fn invoke(&self, _ctx: &InvocationContext, prompt: &str) -> anyhow::Result<AgentReply> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(AgentReply::text(format!("late: {prompt}")))
        }
    }

    fn telegram(delivery: DeliveryMode) -> TaskRoute {
        TaskRoute {
            channel: Some("telegram".into()),
            chat_id: Some("42".into()),
            delivery,
        }
    }

    fn definition(name: &str, prompt: &str, delivery: DeliveryMode) -> ScheduleDefinition {
        ScheduleDefinition {
            name: name.into(),
            cron: "0 9 * * *".into(),
            prompt: prompt.into(),
            delivery,
            channel: Some("telegram".into()),
            chat_id: Some("42".into()),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn task_ceiling_rejects_and_creates_nothing() {
        let f = fixture(SchedulerLimits {
            max_tasks: 2,
            ..Default::default()
        });
        let later = Utc::now() + chrono::Duration::hours(1);
        f.engine.schedule_at("a", later, TaskRoute::default()).await.unwrap();
        f.engine.schedule_every("b", 3600, TaskRoute::default()).await.unwrap();

        let err = f.engine.schedule_at("c", later, TaskRoute::default()).await.unwrap_err();
        assert!(err.to_string().contains("Maximum task limit reached (2)"));
        assert!(err.to_string().contains("Cancel existing tasks first"));
        assert_eq!(f.engine.list_dynamic().await.len(), 2);
        assert_eq!(f.engine.list_timers().await.len(), 2);
    }

    #[tokio::test]
    async fn past_or_present_run_at_is_rejected() {
        let f = fixture(SchedulerLimits::default());
        let err = f
            .engine
            .schedule_at("late", Utc::now() - chrono::Duration::minutes(1), TaskRoute::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NotInFuture { .. }));
        assert!(f.engine.list_dynamic().await.is_empty());
    }

    #[tokio::test]
    async fn interval_below_floor_is_rejected() {
        let f = fixture(SchedulerLimits {
            min_interval_seconds: 300,
            ..Default::default()
        });
        let err = f.engine.schedule_every("x", 60, TaskRoute::default()).await.unwrap_err();
        assert!(err.to_string().contains("minimum of 300s"));
        assert!(f.engine.list_timers().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_interval_is_rejected_without_panicking() {
        let f = fixture(SchedulerLimits::default());
        let err = f
            .engine
            .schedule_every("x", u64::MAX / 2, TaskRoute::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::OutOfRange { field: "interval_seconds", .. }));
        let err = f
            .engine
            .schedule_every("x", u64::MAX, TaskRoute::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(f.engine.list_dynamic().await.is_empty());
        assert!(f.engine.list_timers().await.is_empty());
    }

    #[tokio::test]
    async fn taken_id_is_redrawn_on_admission() {
        let f = fixture(SchedulerLimits::default());
        let later = ScheduleKind::Once {
            run_at: Utc::now() + chrono::Duration::hours(1),
        };
        let taken = new_task(later.clone(), "first".into(), TaskRoute::default());
        f.engine.store().add(taken.clone()).await.unwrap();

        let mut clash = new_task(later, "second".into(), TaskRoute::default());
        clash.id = taken.id.clone();
        let admitted = {
            let mut timers = f.engine.inner.timers.lock().await;
            f.engine.admit(&mut timers, clash).await.unwrap()
        };
        assert_ne!(admitted.id, taken.id);

        let tasks = f.engine.list_dynamic().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(f.engine.store().get(&taken.id).await.unwrap().prompt, "first");
        assert_eq!(f.engine.list_timers().await.len(), 1);
        f.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_firing_still_delivers() {
        let gate = Arc::new(Gate {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let f = fixture_with_invoker(
            SchedulerLimits {
                min_interval_seconds: 60,
                ..Default::default()
            },
            gate.clone(),
            echo,
        );
        let task = f
            .engine
            .schedule_every("report", 60, telegram(DeliveryMode::Channel))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        gate.started.notified().await;
        assert_eq!(f.engine.list_timers().await[0].state, TimerState::Firing);

        f.engine.cancel(&task.id).await.unwrap();
        assert!(f.engine.list_dynamic().await.is_empty());
        assert!(f.sink.sent.lock().unwrap().is_empty());

        gate.release.notify_one();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.sink.sent.lock().unwrap().as_slice(), &["late: report".to_string()]);
        assert!(f.engine.store().get(&task.id).await.is_none());
        assert!(f.engine.list_timers().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_timer_and_record_together() {
        let f = fixture(SchedulerLimits::default());
        let task = f
            .engine
            .schedule_every("poll", 600, telegram(DeliveryMode::Channel))
            .await
            .unwrap();
        assert_eq!(f.engine.list_timers().await.len(), 1);

        let cancelled = f.engine.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.id, task.id);
        assert!(f.engine.list_timers().await.is_empty());
        assert!(f.engine.list_dynamic().await.is_empty());
        assert!(matches!(
            f.engine.cancel(&task.id).await,
            Err(ScheduleError::TaskNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn once_task_fires_delivers_and_disappears() {
        let f = fixture(SchedulerLimits::default());
        let run_at = Utc::now() + chrono::Duration::seconds(30);
        f.engine
            .schedule_at("remind me", run_at, telegram(DeliveryMode::Channel))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(f.echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.sent.lock().unwrap().as_slice(), &["re: remind me".to_string()]);
        assert!(f.engine.list_dynamic().await.is_empty());
        assert!(f.engine.list_timers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_once_task_is_still_removed() {
        let f = fixture(SchedulerLimits::default());
        f.engine
            .schedule_at("fail", Utc::now() + chrono::Duration::seconds(5), TaskRoute::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.echo.calls.load(Ordering::SeqCst), 1);
        assert!(f.engine.list_dynamic().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_task_keeps_firing_and_persists_next_run() {
        let f = fixture(SchedulerLimits {
            min_interval_seconds: 60,
            ..Default::default()
        });
        let task = f
            .engine
            .schedule_every("tick", 60, telegram(DeliveryMode::Channel))
            .await
            .unwrap();
        let first_next = task.next_fire();

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.echo.calls.load(Ordering::SeqCst), 1);
        let stored = f.engine.store().get(&task.id).await.unwrap();
        assert!(stored.next_fire() > first_next);

        let timers = f.engine.list_timers().await;
        assert_eq!(timers[0].fire_count, 1);
        assert_eq!(timers[0].state, TimerState::Registered);
    }

    #[tokio::test]
    async fn startup_prunes_expired_once_and_skips_bad_cron() {
        let f = fixture(SchedulerLimits::default());
        let store = f.engine.store().clone();
        store
            .add(new_task(
                ScheduleKind::Once {
                    run_at: Utc::now() - chrono::Duration::minutes(10),
                },
                "missed".into(),
                TaskRoute::default(),
            ))
            .await
            .unwrap();
        store
            .add(new_task(
                ScheduleKind::Once {
                    run_at: Utc::now() + chrono::Duration::hours(2),
                },
                "later".into(),
                TaskRoute::default(),
            ))
            .await
            .unwrap();

        let mut bad = definition("broken", "x", DeliveryMode::Channel);
        bad.cron = "not a cron".into();
        let mut off = definition("off", "x", DeliveryMode::Channel);
        off.enabled = false;
        let report = f
            .engine
            .start(vec![definition("daily", "brief", DeliveryMode::Channel), bad, off])
            .await
            .unwrap();

        assert_eq!(
            report,
            StartupReport {
                static_registered: 1,
                static_skipped: 2,
                dynamic_registered: 1,
                dynamic_pruned: 1,
            }
        );
        assert_eq!(store.list().await.len(), 1);
        let keys: Vec<String> = f.engine.list_timers().await.into_iter().map(|t| t.key).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"daily".to_string()));
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn agent_delivery_skips_channel_and_truncates() {
        let mut f = fixture(SchedulerLimits::default());
        let long_prompt = "x".repeat(2500);
        f.engine
            .start(vec![definition("digest", &long_prompt, DeliveryMode::Agent)])
            .await
            .unwrap();

        let outcome = f.engine.fire_now("digest").await.unwrap();
        assert!(outcome.succeeded());
        assert!(f.sink.sent.lock().unwrap().is_empty());

        let msg = f.inbox.try_recv().unwrap();
        assert!(f.inbox.try_recv().is_err());
        assert!(msg.content.contains("truncated"));
        assert!(msg.content.chars().count() < 2000 + 200);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn set_enabled_toggles_static_timer() {
        let f = fixture(SchedulerLimits::default());
        f.engine
            .start(vec![definition("daily", "brief", DeliveryMode::Channel)])
            .await
            .unwrap();
        assert!(f.engine.set_enabled("daily", false).await.unwrap());
        assert!(f.engine.list_timers().await.is_empty());
        assert!(!f.engine.set_enabled("daily", true).await.unwrap());
        assert_eq!(f.engine.list_timers().await.len(), 1);
        assert!(matches!(
            f.engine.set_enabled("nope", true).await,
            Err(ScheduleError::ScheduleNotFound(_))
        ));
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn failed_firing_is_recorded_on_the_timer() {
        let f = fixture(SchedulerLimits::default());
        f.engine
            .start(vec![definition("broken-agent", "fail", DeliveryMode::Channel)])
            .await
            .unwrap();
        let outcome = f.engine.fire_now("broken-agent").await.unwrap();
        assert!(outcome.error.unwrap().contains("agent unavailable"));
        let timers = f.engine.list_timers().await;
        assert_eq!(timers[0].state, TimerState::Failed);
        assert_eq!(timers[0].fire_count, 1);
        f.engine.shutdown().await;
    }
}
