// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::registry::TaskRegistry;
use crate::sensor::SensorReader;
use crate::task::LoadTask;
use crate::watchdog::WatchdogHandle;
use crate::window::PowerUsageWindow;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, Timelike};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use sunward_types::{
    PowerRecord, RecordScale, SchedulerConfig, TaskDescriptor, importance_cmp, mean_level,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const MODULE_NAME: &str = "scheduler";

/// Probes per task during sanitize before deregistration.
const SANITIZE_ATTEMPTS: u32 = 3;

/// Scheduler tunables, from the `[scheduler]` configuration section.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub window_size: usize,
    pub ignore_power_threshold: f32,
    pub max_record_gap: ChronoDuration,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            window_size: config.window_size,
            ignore_power_threshold: config.ignore_power_threshold,
            max_record_gap: ChronoDuration::minutes(config.max_record_gap_minutes),
        }
    }
}

/// Per-cycle snapshot of one task: the resolved handle plus its descriptor
/// materialized once, so a task changing its priority mid-cycle cannot
/// skew the sweeps.
#[derive(Clone)]
struct TaskView {
    uri: String,
    handle: Arc<dyn LoadTask>,
    descriptor: TaskDescriptor,
    desc: String,
}

impl TaskView {
    fn importance(&self, other: &TaskView) -> Ordering {
        importance_cmp(&self.descriptor, &other.descriptor)
    }
}

/// Elects, starts and stops tasks.
///
/// Task services register themselves by URI; `run_cycle()` is driven once
/// per minute. Each cycle ingests a power record, sanitizes the task list
/// and runs the eviction sweep followed by the admission sweep. Tasks are
/// independent services: the scheduler never mutates their state except
/// through their public start/stop methods, and any per-task communication
/// failure only skips that task for the cycle.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    window: PowerUsageWindow,
    settings: SchedulerSettings,
    uris: Vec<String>,
    paused: bool,
    paused_locally: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("uris", &self.uris)
            .field("paused", &self.paused)
            .finish()
    }
}

impl Scheduler {
    pub fn new(registry: Arc<TaskRegistry>, settings: SchedulerSettings) -> Self {
        let window =
            PowerUsageWindow::new(settings.window_size, settings.ignore_power_threshold);
        Self {
            registry,
            window,
            settings,
            uris: Vec::new(),
            paused: false,
            paused_locally: false,
        }
    }

    /// Register a task URI. Idempotent; re-registration every cycle is
    /// expected.
    pub fn register_task(&mut self, uri: &str) {
        if !self.uris.iter().any(|candidate| candidate == uri) {
            info!("Task {uri} registered");
            self.uris.push(uri.to_owned());
        }
    }

    pub fn unregister_task(&mut self, uri: &str) {
        if self.uris.iter().any(|candidate| candidate == uri) {
            info!("Task {uri} unregistered");
            self.uris.retain(|candidate| candidate != uri);
        }
    }

    pub fn task_uris(&self) -> &[String] {
        &self.uris
    }

    pub fn window(&self) -> &PowerUsageWindow {
        &self.window
    }

    pub fn is_on_pause(&self) -> bool {
        self.paused
    }

    /// Operator pause: scheduling stops and every running task is sent a
    /// stop, stoppable or not (the task decides whether to honor it). An
    /// operator pause is not auto-resumed when sensor data returns.
    pub async fn pause(&mut self) {
        if !self.paused {
            debug!("Putting the scheduler on pause");
            self.stop_all().await;
            self.paused = true;
            self.paused_locally = false;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            debug!("Resuming the scheduler");
            self.paused = false;
            self.paused_locally = false;
        }
    }

    /// Stop every running task irrespective of stoppability.
    pub async fn stop_all(&mut self) {
        for view in self.collect_views().await {
            if view.handle.is_running().await.unwrap_or(false) {
                info!("Stopping {}", view.desc);
                if let Err(err) = view.handle.stop().await {
                    warn!("Failed to stop {}: {err:#}", view.desc);
                }
            }
        }
    }

    /// One scheduler cycle: read a fresh record (simulator fallback, paused
    /// mode as last resort), feed the window, sanitize and schedule.
    pub async fn run_cycle(&mut self, power: &SensorReader, simulator: &SensorReader) {
        let mut record = power.read(RecordScale::Minute).await;
        if record.is_none() {
            let gap = power.elapsed_since_latest_record();
            debug!(
                "No new power sensor record for {}s",
                gap.num_seconds()
            );
            if gap > self.settings.max_record_gap {
                record = simulator.read(RecordScale::Minute).await;
                if record.is_some() {
                    debug!("Using a record from the simulator");
                } else if simulator.elapsed_since_latest_record() > self.settings.max_record_gap {
                    warn!(
                        "No power sensor record of any kind for more than {} minutes",
                        self.settings.max_record_gap.num_minutes()
                    );
                    if !self.paused {
                        self.stop_all().await;
                        self.paused = true;
                        self.paused_locally = true;
                    }
                }
            }
        }

        let Some(record) = record else {
            return;
        };

        // Auto-pause only: discard pre-outage data before resuming.
        if self.paused && self.paused_locally {
            self.window.clear();
            self.resume();
        }

        self.ingest(record);
        self.sanitize().await;
        self.schedule().await;
    }

    pub fn ingest(&mut self, record: PowerRecord) {
        self.window.update(record);
    }

    /// Remove unreachable tasks: a task failing both probe calls on every
    /// attempt is deregistered.
    pub async fn sanitize(&mut self) {
        let mut unreachable = Vec::new();
        for uri in self.uris.clone() {
            let mut reachable = false;
            for attempt in 0..SANITIZE_ATTEMPTS {
                if let Some(handle) = self.registry.lookup(&uri)
                    && handle.descriptor().await.is_ok()
                    && handle.is_running().await.is_ok()
                {
                    reachable = true;
                    break;
                }
                if attempt + 1 < SANITIZE_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            if !reachable {
                debug!("Communication error with {uri}, removing...");
                unreachable.push(uri);
            }
        }
        self.uris.retain(|uri| !unreachable.contains(uri));
    }

    async fn collect_views(&self) -> Vec<TaskView> {
        let mut views = Vec::new();
        for uri in &self.uris {
            let Some(handle) = self.registry.lookup(uri) else {
                warn!("{uri} does not resolve, skipping this cycle");
                continue;
            };
            match handle.descriptor().await {
                Ok(descriptor) => {
                    let desc = handle.desc().await.unwrap_or_else(|_| uri.clone());
                    views.push(TaskView {
                        uri: uri.clone(),
                        handle,
                        descriptor,
                        desc,
                    });
                }
                Err(err) => warn!("Failed to query {uri}, skipping this cycle: {err:#}"),
            }
        }
        views
    }

    /// The core decision, called once per cycle: the eviction sweep
    /// followed by the admission sweep. Eviction rules are tried in fixed
    /// order and the sweep stops after the first rule that acts; admission
    /// starts tasks one at a time with full recomputation in between.
    pub async fn schedule(&mut self) {
        if self.paused {
            debug!("Scheduler is on pause, task scheduling aborted");
            return;
        }

        let views = self.collect_views().await;
        if views.is_empty() {
            debug!("No registered task");
            return;
        }

        let mut runnable: Vec<TaskView> = Vec::new();
        let mut running: Vec<TaskView> = Vec::new();
        for view in &views {
            if view.handle.is_runnable().await.unwrap_or(false) {
                runnable.push(view.clone());
            }
            if view.handle.is_running().await.unwrap_or(false) {
                running.push(view.clone());
            }
        }
        running.sort_by(|a, b| a.importance(b));
        let mut stopped: Vec<TaskView> = runnable
            .iter()
            .filter(|task| !running.iter().any(|other| other.uri == task.uri))
            .cloned()
            .collect();
        stopped.sort_by(|a, b| b.importance(a));

        debug!(
            "Running {:?}",
            running.iter().map(|task| &task.desc).collect::<Vec<_>>()
        );
        debug!(
            "Stopped {:?}",
            stopped.iter().map(|task| &task.desc).collect::<Vec<_>>()
        );

        // One start or stop per task per cycle: a task evicted below may
        // not be restarted by the admission sweep of the same cycle.
        let mut acted: HashSet<String> = HashSet::new();

        if !running.is_empty() {
            let adjustable: Vec<TaskView> = running
                .iter()
                .filter(|task| task.descriptor.auto_adjust)
                .cloned()
                .collect();

            let mut victims = Self::find_conflicting_power_keys(&running);
            if victims.is_empty() {
                victims = self.find_failing_criteria(&running, &adjustable).await;
            }
            if victims.is_empty() {
                victims = Self::find_diminishing_adjustable(&running, &adjustable).await;
            }
            if victims.is_empty() {
                victims = self
                    .find_lower_priority_tasks(&running, &stopped, &adjustable)
                    .await;
            }

            for victim in victims {
                if !victim.handle.is_stoppable().await.unwrap_or(false) {
                    debug!("{} is not stoppable, leaving it alone", victim.desc);
                    continue;
                }
                info!("Stopping {}", victim.desc);
                if let Err(err) = victim.handle.stop().await {
                    warn!("Failed to stop {}: {err:#}", victim.desc);
                }
                acted.insert(victim.uri.clone());
                running.retain(|task| task.uri != victim.uri);
                stopped.push(victim);
            }
        }

        loop {
            let Some(elected) = self.elect_task(&running, &stopped, &acted).await else {
                break;
            };
            info!("Starting {}", elected.desc);
            if let Err(err) = elected.handle.start().await {
                warn!("Failed to start {}: {err:#}", elected.desc);
            }
            acted.insert(elected.uri.clone());
            stopped.retain(|task| task.uri != elected.uri);
            running.push(elected);
        }
    }

    /// Eviction rule a: running tasks claiming a common metering channel.
    /// Their consumption cannot be told apart, so all but the first keep
    /// their slot.
    fn find_conflicting_power_keys(running: &[TaskView]) -> Vec<TaskView> {
        let mut victims = Vec::new();
        let mut keepers: Vec<&TaskView> = Vec::new();
        for task in running {
            if keepers
                .iter()
                .any(|keeper| keeper.descriptor.shares_keys_with(&task.descriptor))
            {
                debug!("{} conflicts on power keys", task.desc);
                victims.push(task.clone());
            } else {
                keepers.push(task);
            }
        }
        victims
    }

    /// Eviction rule b: the first running task, in ascending priority
    /// order, that no longer meets its own running criteria.
    ///
    /// The full adjustable set is passed as `minimize`, including the task
    /// under examination when it is itself adjustable.
    async fn find_failing_criteria(
        &self,
        running: &[TaskView],
        adjustable: &[TaskView],
    ) -> Vec<TaskView> {
        let mut by_priority = running.to_vec();
        by_priority.sort_by_key(|task| task.descriptor.priority);
        let minimize: Vec<TaskDescriptor> = adjustable
            .iter()
            .map(|task| task.descriptor.clone())
            .collect();
        for task in by_priority {
            let ratio = self
                .window
                .covered_by_production(&task.descriptor, &minimize, &[]);
            let power = self.window.power_used_by(&task.descriptor);
            let meets = task
                .handle
                .meet_running_criteria(ratio, power)
                .await
                .unwrap_or(true);
            if !meets && task.handle.is_stoppable().await.unwrap_or(false) {
                debug!(
                    "{} does not meet its running criteria (ratio={ratio:.2}, {power:.2} kW)",
                    task.desc
                );
                return vec![task];
            }
        }
        Vec::new()
    }

    /// Eviction rule c: a fixed-power task depriving an adjustable task of
    /// headroom. Victim is the lowest-priority running non-adjustable task
    /// below the best adjustable priority.
    async fn find_diminishing_adjustable(
        running: &[TaskView],
        adjustable: &[TaskView],
    ) -> Vec<TaskView> {
        if running.len() <= 1 {
            return Vec::new();
        }
        let Some(best_adjustable) = adjustable
            .iter()
            .map(|task| task.descriptor.priority)
            .max()
        else {
            return Vec::new();
        };
        for task in running {
            if task.descriptor.auto_adjust || task.descriptor.priority >= best_adjustable {
                continue;
            }
            if task.handle.is_stoppable().await.unwrap_or(false) {
                debug!(
                    "{} prevents the adjustable tasks from running to their full potential",
                    task.desc
                );
                return vec![task.clone()];
            }
        }
        Vec::new()
    }

    /// Eviction rule d: running tasks preventing a strictly more important
    /// stopped task from starting.
    async fn find_lower_priority_tasks(
        &self,
        running: &[TaskView],
        stopped: &[TaskView],
        adjustable: &[TaskView],
    ) -> Vec<TaskView> {
        for task in stopped {
            let mut challengers = Vec::new();
            for challenger in running {
                if task.importance(challenger) == Ordering::Greater
                    && challenger.handle.is_stoppable().await.unwrap_or(false)
                {
                    challengers.push(challenger.clone());
                }
            }
            if challengers.is_empty() {
                continue;
            }
            let ignore: Vec<TaskDescriptor> = challengers
                .iter()
                .map(|challenger| challenger.descriptor.clone())
                .collect();
            let minimum: Vec<TaskDescriptor> = adjustable
                .iter()
                .filter(|other| !challengers.iter().any(|c| c.uri == other.uri))
                .map(|other| other.descriptor.clone())
                .collect();
            let ratio = self.window.available_for(&task.descriptor, &minimum, &ignore);
            if task
                .handle
                .meet_running_criteria(ratio, 0.0)
                .await
                .unwrap_or(false)
            {
                debug!(
                    "{} task(s) preventing {} from running",
                    challengers.len(),
                    task.desc
                );
                return challengers;
            }
        }
        Vec::new()
    }

    /// Admission: the most suitable stopped task, or `None`.
    async fn elect_task(
        &self,
        running: &[TaskView],
        stopped: &[TaskView],
        acted: &HashSet<String>,
    ) -> Option<TaskView> {
        let eligible: Vec<TaskView> = stopped
            .iter()
            .filter(|task| {
                !running
                    .iter()
                    .any(|other| other.descriptor.shares_keys_with(&task.descriptor))
            })
            .cloned()
            .collect();
        let ignore: Vec<TaskDescriptor> = eligible
            .iter()
            .map(|task| task.descriptor.clone())
            .collect();
        let minimum: Vec<TaskDescriptor> = running
            .iter()
            .map(|task| task.descriptor.clone())
            .collect();
        let mean_priority = mean_level(running.iter().map(|task| task.descriptor.priority));

        for task in &eligible {
            // A task evicted this cycle stays in the ignore rewrite but may
            // not be restarted until the next cycle.
            if acted.contains(&task.uri) {
                continue;
            }
            let ratio = self.window.available_for(&task.descriptor, &minimum, &ignore);
            let meets = task
                .handle
                .meet_running_criteria(ratio, 0.0)
                .await
                .unwrap_or(false);
            let runnable = task.handle.is_runnable().await.unwrap_or(false);
            if meets
                && runnable
                && (f32::from(task.descriptor.priority.level()) >= mean_priority
                    || task.descriptor.auto_adjust)
            {
                return Some(task.clone());
            }
        }
        None
    }
}

/// Scheduler surface available to task services.
///
/// Mirrors the operator interface: tasks self-register on every cycle and
/// check the pause flag before touching their appliance. A client that
/// cannot reach the scheduler reports it as paused, the conservative
/// answer.
#[async_trait]
pub trait SchedulerControl: Send + Sync {
    async fn register_task(&self, uri: &str);
    async fn unregister_task(&self, uri: &str);
    async fn is_on_pause(&self) -> bool;
}

/// In-process scheduler client handed to task services.
#[derive(Clone)]
pub struct SchedulerClient {
    scheduler: Arc<Mutex<Scheduler>>,
}

impl std::fmt::Debug for SchedulerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerClient").finish()
    }
}

impl SchedulerClient {
    pub fn new(scheduler: Arc<Mutex<Scheduler>>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl SchedulerControl for SchedulerClient {
    async fn register_task(&self, uri: &str) {
        self.scheduler.lock().await.register_task(uri);
    }

    async fn unregister_task(&self, uri: &str) {
        self.scheduler.lock().await.unregister_task(uri);
    }

    async fn is_on_pause(&self) -> bool {
        self.scheduler.lock().await.is_on_pause()
    }
}

/// Sleep until the next wall-clock minute boundary.
pub async fn sleep_until_next_minute() {
    let now = Local::now();
    let into_minute =
        u64::from(now.second()) * 1000 + u64::from(now.timestamp_subsec_millis());
    let wait = 60_000u64.saturating_sub(into_minute).max(1);
    futures_timer::Delay::new(Duration::from_millis(wait)).await;
}

/// Scheduler service loop: heartbeat, wait for the minute boundary, cycle.
pub async fn run_scheduler_service(
    scheduler: Arc<Mutex<Scheduler>>,
    power: SensorReader,
    simulator: SensorReader,
    watchdog: WatchdogHandle,
) {
    watchdog.register(MODULE_NAME);
    info!("Scheduler is now ready to run");
    loop {
        watchdog.register(MODULE_NAME);
        watchdog.kick(MODULE_NAME);
        sleep_until_next_minute().await;
        scheduler.lock().await.run_cycle(&power, &simulator).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::Sensor;
    use anyhow::Result;
    use parking_lot::Mutex as PlMutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
    use sunward_types::Priority;

    /// Scripted task: thresholds decide `meet_running_criteria`, state
    /// flips on start/stop, every call is counted.
    struct ScriptedTask {
        descriptor: PlMutex<TaskDescriptor>,
        runnable: AtomicBool,
        running: AtomicBool,
        stoppable: AtomicBool,
        start_threshold: f32,
        keep_threshold: f32,
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_all_calls: AtomicBool,
    }

    impl ScriptedTask {
        fn new(descriptor: TaskDescriptor) -> Arc<Self> {
            Self::with_thresholds(descriptor, 1.0, 0.9)
        }

        fn with_thresholds(descriptor: TaskDescriptor, start: f32, keep: f32) -> Arc<Self> {
            Arc::new(Self {
                descriptor: PlMutex::new(descriptor),
                runnable: AtomicBool::new(true),
                running: AtomicBool::new(false),
                stoppable: AtomicBool::new(true),
                start_threshold: start,
                keep_threshold: keep,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                fail_all_calls: AtomicBool::new(false),
            })
        }

        fn starts(&self) -> usize {
            self.starts.load(AtomicOrdering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl LoadTask for ScriptedTask {
        async fn descriptor(&self) -> Result<TaskDescriptor> {
            if self.fail_all_calls.load(AtomicOrdering::SeqCst) {
                anyhow::bail!("unreachable");
            }
            Ok(self.descriptor.lock().clone())
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, AtomicOrdering::SeqCst);
            self.running.store(true, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, AtomicOrdering::SeqCst);
            self.running.store(false, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn is_runnable(&self) -> Result<bool> {
            Ok(self.runnable.load(AtomicOrdering::SeqCst))
        }

        async fn is_running(&self) -> Result<bool> {
            if self.fail_all_calls.load(AtomicOrdering::SeqCst) {
                anyhow::bail!("unreachable");
            }
            Ok(self.running.load(AtomicOrdering::SeqCst))
        }

        async fn is_stoppable(&self) -> Result<bool> {
            Ok(self.stoppable.load(AtomicOrdering::SeqCst))
        }

        async fn meet_running_criteria(&self, ratio: f32, _power: f32) -> Result<bool> {
            if self.running.load(AtomicOrdering::SeqCst) {
                Ok(ratio >= self.keep_threshold)
            } else {
                Ok(ratio >= self.start_threshold)
            }
        }

        async fn desc(&self) -> Result<String> {
            let descriptor = self.descriptor.lock();
            Ok(format!("Scripted({})", descriptor.priority))
        }
    }

    fn descriptor(
        priority: Priority,
        power: f32,
        keys: &[&str],
        auto_adjust: bool,
    ) -> TaskDescriptor {
        TaskDescriptor {
            priority,
            power,
            keys: keys.iter().map(|&key| key.to_owned()).collect(),
            auto_adjust,
        }
    }

    fn scheduler_with(registry: Arc<TaskRegistry>) -> Scheduler {
        Scheduler::new(
            registry,
            SchedulerSettings {
                window_size: 12,
                ignore_power_threshold: 0.1,
                max_record_gap: ChronoDuration::minutes(3),
            },
        )
    }

    struct StaticSensor {
        record: PlMutex<Option<PowerRecord>>,
    }

    #[async_trait]
    impl Sensor for StaticSensor {
        async fn read(&self, _scale: RecordScale) -> Result<PowerRecord> {
            match self.record.lock().clone() {
                Some(record) => Ok(record),
                None => Ok(PowerRecord::new()),
            }
        }

        async fn units(&self, scale: RecordScale) -> Result<BTreeMap<String, String>> {
            let _ = scale;
            Ok(BTreeMap::new())
        }
    }

    fn reader(record: Option<PowerRecord>) -> SensorReader {
        SensorReader::new(
            "power",
            Arc::new(StaticSensor {
                record: PlMutex::new(record),
            }),
        )
    }

    #[tokio::test]
    async fn test_no_registered_task_is_a_noop() {
        let registry = Arc::new(TaskRegistry::new());
        let mut scheduler = scheduler_with(registry);
        scheduler.ingest(PowerRecord::from([("net", -5.0)]));
        scheduler.schedule().await;
        assert!(scheduler.task_uris().is_empty());
    }

    #[tokio::test]
    async fn test_register_task_is_idempotent() {
        let registry = Arc::new(TaskRegistry::new());
        let mut scheduler = scheduler_with(registry);
        for _ in 0..5 {
            scheduler.register_task("task.wh");
        }
        assert_eq!(scheduler.task_uris(), ["task.wh".to_owned()]);
    }

    #[tokio::test]
    async fn test_simple_start() {
        // S1: surplus covers 1.5x the task minimum, the task is started.
        let registry = Arc::new(TaskRegistry::new());
        let task = ScriptedTask::new(descriptor(Priority::Medium, 2.0, &["wh"], false));
        registry.register("task.wh", task.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.wh");
        scheduler.ingest(PowerRecord::from([
            ("net", -3.0),
            ("solar", -5.0),
            ("wh", 0.0),
            ("other", 2.0),
        ]));
        scheduler.schedule().await;
        assert_eq!(task.starts(), 1);
        assert_eq!(task.stops(), 0);
    }

    #[tokio::test]
    async fn test_no_start_without_surplus() {
        let registry = Arc::new(TaskRegistry::new());
        let task = ScriptedTask::new(descriptor(Priority::Medium, 2.0, &["wh"], false));
        registry.register("task.wh", task.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.wh");
        scheduler.ingest(PowerRecord::from([("net", 1.0), ("wh", 0.0)]));
        scheduler.schedule().await;
        assert_eq!(task.starts(), 0);
    }

    #[tokio::test]
    async fn test_unrunnable_task_is_never_started() {
        let registry = Arc::new(TaskRegistry::new());
        let task = ScriptedTask::new(descriptor(Priority::Medium, 2.0, &["wh"], false));
        task.runnable.store(false, AtomicOrdering::SeqCst);
        registry.register("task.wh", task.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.wh");
        scheduler.ingest(PowerRecord::from([("net", -5.0), ("wh", 0.0)]));
        scheduler.schedule().await;
        assert_eq!(task.starts(), 0);
    }

    #[tokio::test]
    async fn test_keyed_exclusion() {
        // S2: two running tasks share a channel; the later registrant is
        // stopped.
        let registry = Arc::new(TaskRegistry::new());
        let first = ScriptedTask::new(descriptor(Priority::Medium, 1.5, &["ev"], false));
        let second = ScriptedTask::new(descriptor(Priority::Medium, 1.5, &["ev"], false));
        first.running.store(true, AtomicOrdering::SeqCst);
        second.running.store(true, AtomicOrdering::SeqCst);
        registry.register("task.a", first.clone());
        registry.register("task.b", second.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.a");
        scheduler.register_task("task.b");
        scheduler.ingest(PowerRecord::from([("net", -5.0), ("ev", 1.5)]));
        scheduler.schedule().await;
        assert_eq!(first.stops(), 0);
        assert_eq!(second.stops(), 1);
    }

    #[tokio::test]
    async fn test_keyed_exclusion_respects_stoppable() {
        let registry = Arc::new(TaskRegistry::new());
        let first = ScriptedTask::new(descriptor(Priority::Medium, 1.5, &["ev"], false));
        let second = ScriptedTask::new(descriptor(Priority::Medium, 1.5, &["ev"], false));
        first.running.store(true, AtomicOrdering::SeqCst);
        second.running.store(true, AtomicOrdering::SeqCst);
        second.stoppable.store(false, AtomicOrdering::SeqCst);
        registry.register("task.a", first.clone());
        registry.register("task.b", second.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.a");
        scheduler.register_task("task.b");
        scheduler.ingest(PowerRecord::from([("net", -5.0), ("ev", 1.5)]));
        scheduler.schedule().await;
        assert_eq!(second.stops(), 0);
    }

    #[tokio::test]
    async fn test_preemption() {
        // S3: a HIGH stopped task evicts the stoppable LOW running task,
        // then gets started.
        let registry = Arc::new(TaskRegistry::new());
        let low = ScriptedTask::new(descriptor(Priority::Low, 2.0, &["heater"], false));
        low.running.store(true, AtomicOrdering::SeqCst);
        let high = ScriptedTask::new(descriptor(Priority::High, 1.5, &["wh"], false));
        registry.register("task.low", low.clone());
        registry.register("task.high", high.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.low");
        scheduler.register_task("task.high");
        scheduler.ingest(PowerRecord::from([
            ("net", -0.4),
            ("solar", -3.0),
            ("heater", 2.0),
            ("other", 0.6),
        ]));
        scheduler.schedule().await;
        assert_eq!(low.stops(), 1);
        assert_eq!(high.starts(), 1);
        // One action per task per cycle: the evicted task must not have
        // been restarted.
        assert_eq!(low.starts(), 0);
    }

    #[tokio::test]
    async fn test_equal_importance_does_not_preempt() {
        let registry = Arc::new(TaskRegistry::new());
        let running = ScriptedTask::new(descriptor(Priority::Medium, 2.0, &["a"], false));
        running.running.store(true, AtomicOrdering::SeqCst);
        let stopped = ScriptedTask::new(descriptor(Priority::Medium, 2.0, &["b"], false));
        registry.register("task.running", running.clone());
        registry.register("task.stopped", stopped.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.running");
        scheduler.register_task("task.stopped");
        // Enough export to keep the running task alive, not enough to also
        // admit the stopped one.
        scheduler.ingest(PowerRecord::from([("net", -0.1), ("a", 2.0)]));
        scheduler.schedule().await;
        assert_eq!(running.stops(), 0);
        assert_eq!(stopped.starts(), 0);
    }

    #[tokio::test]
    async fn test_hysteresis_eviction() {
        // S4: coverage fell to 0.85, below the 0.9 keep-running bar.
        let registry = Arc::new(TaskRegistry::new());
        let task = ScriptedTask::new(descriptor(Priority::Medium, 4.0, &["wh"], false));
        task.running.store(true, AtomicOrdering::SeqCst);
        registry.register("task.wh", task.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.wh");
        scheduler.ingest(PowerRecord::from([("net", 0.6), ("wh", 4.0)]));
        scheduler.schedule().await;
        assert_eq!(task.stops(), 1);
    }

    #[tokio::test]
    async fn test_hysteresis_keeps_marginal_task() {
        // Coverage 0.95 is below the start bar but above the keep bar.
        let registry = Arc::new(TaskRegistry::new());
        let task = ScriptedTask::new(descriptor(Priority::Medium, 4.0, &["wh"], false));
        task.running.store(true, AtomicOrdering::SeqCst);
        registry.register("task.wh", task.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.wh");
        scheduler.ingest(PowerRecord::from([("net", 0.2), ("wh", 4.0)]));
        scheduler.schedule().await;
        assert_eq!(task.stops(), 0);
    }

    #[tokio::test]
    async fn test_diminishing_adjustable() {
        // S6: a LOW fixed heater is stopped so the HIGH adjustable charger
        // can scale up.
        let registry = Arc::new(TaskRegistry::new());
        let charger = ScriptedTask::with_thresholds(
            descriptor(Priority::High, 1.4, &["ev"], true),
            1.0,
            0.0,
        );
        charger.running.store(true, AtomicOrdering::SeqCst);
        let heater = ScriptedTask::with_thresholds(
            descriptor(Priority::Low, 2.0, &["heater"], false),
            1.0,
            0.0,
        );
        heater.running.store(true, AtomicOrdering::SeqCst);
        registry.register("task.ev", charger.clone());
        registry.register("task.heater", heater.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.ev");
        scheduler.register_task("task.heater");
        scheduler.ingest(PowerRecord::from([
            ("net", -0.5),
            ("ev", 1.4),
            ("heater", 2.0),
        ]));
        scheduler.schedule().await;
        assert_eq!(heater.stops(), 1);
        assert_eq!(charger.stops(), 0);
    }

    #[tokio::test]
    async fn test_sanitize_removes_unreachable_task() {
        let registry = Arc::new(TaskRegistry::new());
        let task = ScriptedTask::new(descriptor(Priority::Medium, 2.0, &["wh"], false));
        task.fail_all_calls.store(true, AtomicOrdering::SeqCst);
        registry.register("task.wh", task);
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.wh");
        scheduler.register_task("task.ghost");
        scheduler.sanitize().await;
        assert!(scheduler.task_uris().is_empty());
    }

    #[tokio::test]
    async fn test_auto_pause_and_resume_clears_window() {
        // S5: no record of any kind past the gap: stop everything and
        // pause; the next record resumes with a cleared window.
        let registry = Arc::new(TaskRegistry::new());
        let task = ScriptedTask::new(descriptor(Priority::Medium, 2.0, &["wh"], false));
        task.running.store(true, AtomicOrdering::SeqCst);
        task.stoppable.store(false, AtomicOrdering::SeqCst);
        registry.register("task.wh", task.clone());
        let mut scheduler = scheduler_with(registry.clone());
        scheduler.register_task("task.wh");
        scheduler.ingest(PowerRecord::from([("net", -1.0), ("wh", 2.0)]));

        let power = reader(None);
        let simulator = reader(None);
        power.set_latest_read(Local::now() - ChronoDuration::minutes(5));
        simulator.set_latest_read(Local::now() - ChronoDuration::minutes(5));
        scheduler.run_cycle(&power, &simulator).await;

        assert!(scheduler.is_on_pause());
        // stop_all ignores stoppability.
        assert_eq!(task.stops(), 1);

        // A record arrives: auto-pause lifts and pre-outage data is gone.
        let power = reader(Some(PowerRecord::from([("net", -3.0), ("wh", 0.0)])));
        scheduler.run_cycle(&power, &simulator).await;
        assert!(!scheduler.is_on_pause());
        assert_eq!(scheduler.window().len(), 1);
    }

    #[tokio::test]
    async fn test_operator_pause_is_not_auto_resumed() {
        let registry = Arc::new(TaskRegistry::new());
        let mut scheduler = scheduler_with(registry);
        scheduler.pause().await;
        let power = reader(Some(PowerRecord::from([("net", -3.0)])));
        let simulator = reader(None);
        scheduler.run_cycle(&power, &simulator).await;
        assert!(scheduler.is_on_pause());
        scheduler.resume();
        assert!(!scheduler.is_on_pause());
    }

    #[tokio::test]
    async fn test_low_priority_adjustable_is_admitted() {
        // An adjustable task below the mean running priority still gets in.
        let registry = Arc::new(TaskRegistry::new());
        let heater = ScriptedTask::with_thresholds(
            descriptor(Priority::High, 1.0, &["wh"], false),
            1.0,
            0.0,
        );
        heater.running.store(true, AtomicOrdering::SeqCst);
        let charger = ScriptedTask::new(descriptor(Priority::Low, 1.4, &["ev"], true));
        registry.register("task.wh", heater.clone());
        registry.register("task.ev", charger.clone());
        let mut scheduler = scheduler_with(registry);
        scheduler.register_task("task.wh");
        scheduler.register_task("task.ev");
        scheduler.ingest(PowerRecord::from([
            ("net", -2.0),
            ("wh", 1.0),
            ("ev", 0.0),
        ]));
        scheduler.schedule().await;
        assert_eq!(charger.starts(), 1);
    }
}
