// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::models::interp;
use crate::service::TaskServiceContext;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime};
use parking_lot::Mutex;
use std::sync::Arc;
use sunward_adapters::SwitchClient;
use sunward_core::{
    LoadTask, MonitorSink, ProductionOracle, SchedulerControl, Store, TaskRegistry,
    WeatherOracle, sleep_until_next_minute,
};
use sunward_types::{PoolPumpConfig, Priority, TaskDescriptor};
use tracing::{debug, info, warn};

pub const MODULE_NAME: &str = "pool_pump";

/// Typical pump draw, kW. The pump is a fixed single-speed load.
const PUMP_POWER: f32 = 2.0;

/// Daily runtime budget in minutes as a function of the early-morning
/// water temperature proxy: one hour in cold water, four and a half in
/// warm.
const RUNTIME_CURVE: [(f32, f32); 2] = [(52.0, 60.0), (75.0, 4.5 * 60.0)];

/// The pump must visibly draw power this long after a start before the
/// health check trusts it.
fn health_grace() -> ChronoDuration {
    ChronoDuration::minutes(2)
}

/// How long a pump that does not draw power is benched.
fn unhealthy_delay() -> ChronoDuration {
    ChronoDuration::minutes(30)
}

/// Relay switch surface the task needs.
#[async_trait]
pub trait PoolSwitch: Send + Sync {
    /// (online, switched on)
    async fn status(&self) -> Result<(bool, bool)>;

    async fn turn(&self, on: bool) -> Result<()>;
}

/// The production switch: one relay device on the vendor cloud.
pub struct CloudPoolSwitch {
    client: SwitchClient,
    device_id: String,
}

impl std::fmt::Debug for CloudPoolSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudPoolSwitch")
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl CloudPoolSwitch {
    pub fn new(client: SwitchClient, device_id: impl Into<String>) -> Self {
        Self {
            client,
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl PoolSwitch for CloudPoolSwitch {
    async fn status(&self) -> Result<(bool, bool)> {
        let device = self.client.device(&self.device_id).await?;
        Ok((device.online, device.is_on()))
    }

    async fn turn(&self, on: bool) -> Result<()> {
        Ok(self.client.set_switch(&self.device_id, on).await?)
    }
}

#[derive(Debug, Default)]
struct PumpState {
    remaining_runtime: ChronoDuration,
    target_time: Option<DateTime<Local>>,
    started_at: Option<DateTime<Local>>,
    last_update: Option<DateTime<Local>>,
    not_runnable_until: Option<DateTime<Local>>,
    priority: Priority,
}

/// Pool pump task over a cloud relay switch.
///
/// The pump earns a daily runtime budget sized by the water temperature
/// (approximated by the overnight low) and spends it minute by minute
/// while the relay reports on. The spent minutes are persisted so a
/// restart does not grant a fresh budget.
pub struct PoolPumpTask {
    switch: Arc<dyn PoolSwitch>,
    config: PoolPumpConfig,
    store: Arc<Store>,
    state: Mutex<PumpState>,
}

impl std::fmt::Debug for PoolPumpTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPumpTask").finish()
    }
}

fn ledger_key(day: DateTime<Local>) -> String {
    format!("runtime_{}", day.format("%Y-%m-%d"))
}

impl PoolPumpTask {
    pub fn new(switch: Arc<dyn PoolSwitch>, store: Arc<Store>, config: PoolPumpConfig) -> Self {
        Self {
            switch,
            config,
            store,
            state: Mutex::new(PumpState::default()),
        }
    }

    fn min_run_time(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.min_run_time_secs as i64)
    }

    /// Minutes the pump already ran today, from the persisted ledger.
    fn already_ran_today(&self) -> ChronoDuration {
        let minutes: f32 = self
            .store
            .get(MODULE_NAME, &ledger_key(Local::now()))
            .ok()
            .flatten()
            .unwrap_or(0.0);
        ChronoDuration::minutes(minutes as i64)
    }

    fn record_ran_today(&self, ran: ChronoDuration) {
        let key = ledger_key(Local::now());
        let minutes: f32 = self
            .store
            .get(MODULE_NAME, &key)
            .ok()
            .flatten()
            .unwrap_or(0.0);
        let minutes = minutes + ran.num_seconds() as f32 / 60.0;
        if let Err(err) = self.store.put(MODULE_NAME, &key, &minutes) {
            warn!("Failed to persist the runtime ledger: {err:#}");
        }
    }

    /// Burn down the remaining budget by the time actually run since the
    /// last update.
    pub async fn update_remaining_runtime(&self) -> Result<()> {
        let (_, on) = self.switch.status().await?;
        let now = Local::now();
        let mut state = self.state.lock();
        if on {
            let started_at = *state.started_at.get_or_insert(now);
            let since = state.last_update.unwrap_or(now).max(started_at);
            let ran = now - since;
            if ran > ChronoDuration::zero() {
                state.remaining_runtime = (state.remaining_runtime - ran)
                    .max(ChronoDuration::zero());
                drop(state);
                self.record_ran_today(ran);
                state = self.state.lock();
            }
        }
        debug!("Remaining runtime: {}", state.remaining_runtime);
        state.last_update = Some(now);
        Ok(())
    }

    /// Compute today's cycle: the runtime budget from the overnight
    /// forecast, minus what already ran, and the target time from the
    /// production window.
    pub async fn configure_cycle(
        &self,
        production: &dyn ProductionOracle,
        weather: &dyn WeatherOracle,
    ) -> Result<()> {
        let (_, target_time) = production.next_power_window(PUMP_POWER).await?;
        let tomorrow = Local::now() + ChronoDuration::days(1);
        let early_morning = tomorrow
            .date_naive()
            .and_time(NaiveTime::from_hms_opt(5, 0, 0).unwrap_or_default())
            .and_local_timezone(Local)
            .earliest()
            .unwrap_or(tomorrow);
        let temperature = weather.temperature_at(early_morning).await?;
        let mut budget = ChronoDuration::minutes(interp(&RUNTIME_CURVE, temperature) as i64);
        if Local::now().date_naive() == target_time.date_naive() {
            budget = (budget - self.already_ran_today()).max(ChronoDuration::zero());
        }
        let mut state = self.state.lock();
        state.remaining_runtime = budget;
        state.target_time = Some(target_time);
        debug!("target_time updated to {target_time}, budget {budget}");
        Ok(())
    }

    /// MEDIUM once the remaining budget no longer fits between now and
    /// the end of useful sun.
    pub fn adjust_priority(&self) {
        let now = Local::now();
        let mut state = self.state.lock();
        let urgent = state.target_time.is_some_and(|target| {
            now < target && target <= now + state.remaining_runtime
        });
        state.priority = if urgent {
            Priority::Medium
        } else {
            Priority::Low
        };
    }

    fn has_been_running_for(&self, on: bool) -> ChronoDuration {
        let mut state = self.state.lock();
        if on {
            let started_at = *state.started_at.get_or_insert_with(Local::now);
            Local::now() - started_at
        } else {
            ChronoDuration::zero()
        }
    }

    #[cfg(test)]
    fn set_remaining(&self, remaining: ChronoDuration) {
        self.state.lock().remaining_runtime = remaining;
    }
}

#[async_trait]
impl LoadTask for PoolPumpTask {
    async fn descriptor(&self) -> Result<TaskDescriptor> {
        let state = self.state.lock();
        Ok(TaskDescriptor {
            priority: state.priority,
            power: PUMP_POWER,
            keys: vec![self.config.power_sensor_key.clone()],
            auto_adjust: false,
        })
    }

    async fn start(&self) -> Result<()> {
        debug!("Starting");
        self.switch.turn(true).await?;
        self.state.lock().started_at = Some(Local::now());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        debug!("Stopping");
        self.switch.turn(false).await?;
        self.state.lock().started_at = None;
        Ok(())
    }

    async fn is_runnable(&self) -> Result<bool> {
        let (online, _) = self.switch.status().await?;
        let state = self.state.lock();
        let benched = state
            .not_runnable_until
            .is_some_and(|until| Local::now() < until);
        Ok(online && !benched && state.remaining_runtime > ChronoDuration::zero())
    }

    async fn is_running(&self) -> Result<bool> {
        let (_, on) = self.switch.status().await?;
        Ok(on)
    }

    async fn is_stoppable(&self) -> Result<bool> {
        let (online, on) = self.switch.status().await?;
        Ok(online && self.has_been_running_for(on) > self.min_run_time())
    }

    async fn meet_running_criteria(&self, ratio: f32, power: f32) -> Result<bool> {
        debug!("meet_running_criteria({ratio:.3}, {power:.3})");
        if !self.is_runnable().await? {
            return Ok(false);
        }
        let (_, on) = self.switch.status().await?;
        let running_for = self.has_been_running_for(on);
        if running_for > health_grace() && power < PUMP_POWER / 4.0 {
            // The relay says on but nothing draws: tripped breaker or a
            // stuck relay. Refuse to run and let the monitor escalate.
            warn!("Pump reports on but draws {power:.2} kW, benching");
            self.state.lock().not_runnable_until = Some(Local::now() + unhealthy_delay());
            return Ok(false);
        }
        if on {
            Ok(ratio >= 0.9)
        } else {
            Ok(ratio >= 1.0)
        }
    }

    async fn desc(&self) -> Result<String> {
        let state = self.state.lock();
        Ok(format!(
            "PoolPump({}, {} remaining)",
            state.priority, state.remaining_runtime
        ))
    }
}

/// Pool pump service loop, once per minute.
pub async fn run_pool_pump_service(
    task: Arc<PoolPumpTask>,
    context: TaskServiceContext,
    production: Arc<dyn ProductionOracle>,
    weather: Arc<dyn WeatherOracle>,
) {
    let uri = TaskRegistry::task_uri(MODULE_NAME);
    context.registry.register(&uri, task.clone());
    info!("Pool pump service is now ready to run");
    loop {
        context.watchdog.register(MODULE_NAME);
        context.watchdog.kick(MODULE_NAME);
        context.registry.register(&uri, task.clone());

        let target_passed = {
            let state = task.state.lock();
            state
                .target_time
                .is_none_or(|target| Local::now() > target)
        };
        if target_passed
            && let Err(err) = task
                .configure_cycle(production.as_ref(), weather.as_ref())
                .await
        {
            debug!("configure_cycle() failed: {err:#}");
        }

        if let Err(err) = task.update_remaining_runtime().await {
            warn!("Could not update the remaining runtime: {err:#}");
        }

        match task.switch.status().await {
            Ok(_) => {
                context.monitor.track("switch cloud", true);
                context.scheduler.register_task(&uri).await;
            }
            Err(err) => {
                warn!("Self-test failed, unregistering from the scheduler: {err:#}");
                context.monitor.track("switch cloud", false);
                context.scheduler.unregister_task(&uri).await;
            }
        }

        sleep_until_next_minute().await;
        task.adjust_priority();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeSwitch {
        online: AtomicBool,
        on: AtomicBool,
    }

    impl FakeSwitch {
        fn new() -> Self {
            Self {
                online: AtomicBool::new(true),
                on: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PoolSwitch for FakeSwitch {
        async fn status(&self) -> Result<(bool, bool)> {
            Ok((
                self.online.load(Ordering::SeqCst),
                self.on.load(Ordering::SeqCst),
            ))
        }

        async fn turn(&self, on: bool) -> Result<()> {
            self.on.store(on, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> PoolPumpConfig {
        PoolPumpConfig {
            power_sensor_key: "pool".to_owned(),
            min_run_time_secs: 60 * 7,
            switch: sunward_types::SwitchDriverConfig {
                base_url: String::new(),
                login: String::new(),
                password: String::new(),
                device_id: String::new(),
            },
        }
    }

    fn task_with_store() -> (Arc<FakeSwitch>, Arc<Store>, PoolPumpTask, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = Arc::new(Store::open(path.to_str().unwrap()).unwrap());
        let switch = Arc::new(FakeSwitch::new());
        let task = PoolPumpTask::new(switch.clone(), store.clone(), config());
        (switch, store, task, dir)
    }

    #[tokio::test]
    async fn test_runnable_needs_budget_and_online_switch() {
        let (switch, _store, task, _dir) = task_with_store();
        assert!(!task.is_runnable().await.unwrap());
        task.set_remaining(ChronoDuration::minutes(90));
        assert!(task.is_runnable().await.unwrap());
        switch.online.store(false, Ordering::SeqCst);
        assert!(!task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn test_budget_burns_down_and_is_persisted() {
        let (switch, _store, task, _dir) = task_with_store();
        task.set_remaining(ChronoDuration::minutes(90));
        switch.on.store(true, Ordering::SeqCst);
        {
            let mut state = task.state.lock();
            state.started_at = Some(Local::now() - ChronoDuration::minutes(10));
            state.last_update = Some(Local::now() - ChronoDuration::minutes(5));
        }
        task.update_remaining_runtime().await.unwrap();
        let remaining = task.state.lock().remaining_runtime;
        assert!(remaining <= ChronoDuration::minutes(85));
        assert!(remaining >= ChronoDuration::minutes(84));
        // The spent minutes land in today's ledger.
        assert!(task.already_ran_today() >= ChronoDuration::minutes(4));
    }

    #[tokio::test]
    async fn test_budget_never_goes_negative() {
        let (switch, _store, task, _dir) = task_with_store();
        task.set_remaining(ChronoDuration::minutes(1));
        switch.on.store(true, Ordering::SeqCst);
        {
            let mut state = task.state.lock();
            state.started_at = Some(Local::now() - ChronoDuration::minutes(30));
            state.last_update = Some(Local::now() - ChronoDuration::minutes(30));
        }
        task.update_remaining_runtime().await.unwrap();
        assert_eq!(
            task.state.lock().remaining_runtime,
            ChronoDuration::zero()
        );
    }

    #[tokio::test]
    async fn test_unhealthy_pump_is_benched() {
        let (switch, _store, task, _dir) = task_with_store();
        task.set_remaining(ChronoDuration::minutes(90));
        switch.on.store(true, Ordering::SeqCst);
        task.state.lock().started_at = Some(Local::now() - ChronoDuration::minutes(5));
        // Relay on for five minutes with no draw at all.
        assert!(!task.meet_running_criteria(1.5, 0.1).await.unwrap());
        assert!(!task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn test_hysteresis_when_healthy() {
        let (switch, _store, task, _dir) = task_with_store();
        task.set_remaining(ChronoDuration::minutes(90));
        assert!(task.meet_running_criteria(1.0, 0.0).await.unwrap());
        assert!(!task.meet_running_criteria(0.95, 0.0).await.unwrap());
        switch.on.store(true, Ordering::SeqCst);
        task.state.lock().started_at = Some(Local::now() - ChronoDuration::minutes(5));
        assert!(task.meet_running_criteria(0.95, 1.9).await.unwrap());
        assert!(!task.meet_running_criteria(0.85, 1.9).await.unwrap());
    }

    #[tokio::test]
    async fn test_stoppable_after_min_run_time() {
        let (switch, _store, task, _dir) = task_with_store();
        switch.on.store(true, Ordering::SeqCst);
        task.state.lock().started_at = Some(Local::now() - ChronoDuration::minutes(3));
        assert!(!task.is_stoppable().await.unwrap());
        task.state.lock().started_at = Some(Local::now() - ChronoDuration::minutes(8));
        assert!(task.is_stoppable().await.unwrap());
    }

    #[tokio::test]
    async fn test_priority_ramps_near_target() {
        let (_switch, _store, task, _dir) = task_with_store();
        task.set_remaining(ChronoDuration::minutes(120));
        task.state.lock().target_time = Some(Local::now() + ChronoDuration::minutes(60));
        task.adjust_priority();
        assert_eq!(task.descriptor().await.unwrap().priority, Priority::Medium);
        // Plenty of sun left: back to LOW.
        task.state.lock().target_time = Some(Local::now() + ChronoDuration::hours(8));
        task.adjust_priority();
        assert_eq!(task.descriptor().await.unwrap().priority, Priority::Low);
    }
}
