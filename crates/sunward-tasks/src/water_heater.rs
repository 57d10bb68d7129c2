// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::service::TaskServiceContext;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use sunward_adapters::{TankClient, TankMode, TankSchedule};
use sunward_core::{
    LoadTask, MonitorSink, ProductionOracle, SchedulerControl, Sensor, TaskRegistry,
    sleep_until_next_minute,
};
use sunward_types::{
    PowerRecord, Priority, RecordScale, TaskDescriptor, WaterHeaterConfig,
};
use tracing::{debug, info, warn};

pub const MODULE_NAME: &str = "water_heater";

fn fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Tank controller surface the task needs; implemented by the cloud
/// client and by fakes in tests.
#[async_trait]
pub trait TankDevice: Send + Sync {
    /// Water temperature (Celsius) and available fraction (0 to 1).
    async fn water(&self) -> Result<(f32, f32)>;

    async fn current_mode(&self) -> Result<TankMode>;

    /// The timer's scheduled off-periods.
    async fn timer_schedules(&self) -> Result<Vec<TankSchedule>>;

    async fn set_mode(&self, mode: TankMode, duration: ChronoDuration) -> Result<()>;

    async fn clear_mode(&self, mode: TankMode) -> Result<()>;
}

#[async_trait]
impl TankDevice for TankClient {
    async fn water(&self) -> Result<(f32, f32)> {
        let water = TankClient::water(self).await?;
        Ok((water.temperature, water.available))
    }

    async fn current_mode(&self) -> Result<TankMode> {
        Ok(TankClient::current_mode(self).await?)
    }

    async fn timer_schedules(&self) -> Result<Vec<TankSchedule>> {
        Ok(TankClient::timer_schedules(self).await?)
    }

    async fn set_mode(&self, mode: TankMode, duration: ChronoDuration) -> Result<()> {
        // Backdate the start so the override applies immediately.
        let start = Utc::now() - ChronoDuration::minutes(1);
        let end = Utc::now() + duration;
        Ok(TankClient::set_mode(self, mode, start, end).await?)
    }

    async fn clear_mode(&self, mode: TankMode) -> Result<()> {
        Ok(TankClient::clear_mode(self, mode).await?)
    }
}

#[derive(Debug, Default)]
struct HeaterState {
    /// Pessimistic (temperature Celsius, tank level fraction) envelope.
    filtered: Option<(f32, f32)>,
    priority: Priority,
    has_reached_target: bool,
    target_time: Option<DateTime<Local>>,
    started_at: Option<DateTime<Local>>,
    not_runnable_until: Option<DateTime<Local>>,
}

/// Cloud-tank water heater task and sensor.
///
/// The device stays configured in timer mode, so if this service or the
/// cloud goes away the tank falls back on its own schedule. Start means a
/// boost override, stop means returning to the timer (plus an away
/// override when a scheduled on-window is active).
///
/// The tank's level and temperature outputs are partially synthetic and
/// overshoot right after a short run. The task keeps a pessimistic
/// envelope of both and, when the heater stops drawing power early, it
/// trusts the hardware over the cloud and benches itself for a while.
pub struct WaterHeaterTask {
    tank: Arc<dyn TankDevice>,
    config: WaterHeaterConfig,
    state: Mutex<HeaterState>,
}

impl std::fmt::Debug for WaterHeaterTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaterHeaterTask").finish()
    }
}

impl WaterHeaterTask {
    pub fn new(tank: Arc<dyn TankDevice>, config: WaterHeaterConfig) -> Self {
        Self {
            tank,
            config,
            state: Mutex::new(HeaterState::default()),
        }
    }

    fn min_run_time(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.min_run_time_secs as i64)
    }

    /// Read the tank and fold it into the pessimistic envelope. Returns
    /// (available percent, temperature Fahrenheit).
    async fn refresh(&self) -> Result<(f32, f32)> {
        let (temperature, level) = self.tank.water().await?;
        let mut state = self.state.lock();
        let now = Local::now();
        let force = state
            .not_runnable_until
            .is_some_and(|until| now < until);
        if let Some((_, filtered_level)) = state.filtered
            && filtered_level > level
        {
            // Hot water was drawn: whatever benched us no longer holds.
            debug!("Tank level dropped ({filtered_level:.2} -> {level:.2}), runnable again");
            state.not_runnable_until = None;
        }
        let accept = force
            || match state.filtered {
                None => true,
                Some((filtered_temp, filtered_level)) => {
                    temperature < filtered_temp || level < filtered_level
                }
            };
        if accept {
            state.filtered = Some((temperature, level));
        }
        let (temperature, level) = state.filtered.unwrap_or((temperature, level));
        Ok((level * 100.0, fahrenheit(temperature)))
    }

    /// Time to bring the whole tank to the desired temperature, assuming
    /// refill water at 60 F.
    fn estimate_run_time(&self, available: f32, temperature: f32) -> ChronoDuration {
        let blended = 60.0 * (100.0 - available) / 100.0 + temperature * available / 100.0;
        let deviation = (self.config.desired_temperature - blended).max(0.0);
        ChronoDuration::minutes((deviation * self.config.minutes_per_degree) as i64)
    }

    fn has_been_running_for(&self, running: bool) -> ChronoDuration {
        let mut state = self.state.lock();
        if running {
            // It may have been started behind our back (from the vendor
            // application for instance).
            let started_at = *state.started_at.get_or_insert_with(Local::now);
            Local::now() - started_at
        } else {
            ChronoDuration::zero()
        }
    }

    /// Today's scheduled on-windows: the gaps between the timer's
    /// off-periods, as times of day.
    async fn today_schedule(&self) -> Result<Vec<(NaiveTime, NaiveTime)>> {
        let today = Local::now().weekday().num_days_from_sunday();
        let mut schedules: Vec<TankSchedule> = self
            .tank
            .timer_schedules()
            .await?
            .into_iter()
            .filter(|schedule| schedule.days_of_week.contains(&today))
            .collect();
        schedules.sort_by_key(|schedule| schedule.start);
        Ok(schedules
            .windows(2)
            .map(|pair| (pair[0].end, pair[1].start))
            .collect())
    }

    /// Active scheduled on-window containing `at`, if any.
    async fn on_window_at(&self, at: NaiveTime) -> Result<Option<(NaiveTime, NaiveTime)>> {
        Ok(self
            .today_schedule()
            .await?
            .into_iter()
            .find(|&(start, end)| start <= at && at < end))
    }

    /// Put the tank in away mode if its own schedule is about to turn it
    /// on: while the scheduler is active, the schedule must not race it.
    pub async fn prevent_auto_start(&self) -> Result<()> {
        if self.is_running().await? || self.tank.current_mode().await? != TankMode::Timer {
            return Ok(());
        }
        let now = Local::now().time();
        let soon = now + ChronoDuration::minutes(3);
        if let Some((_, end)) = self.on_window_at(soon).await? {
            let remainder = end.signed_duration_since(now);
            debug!("Schedule about to turn the tank on, away for {remainder}");
            self.tank.set_mode(TankMode::Away, remainder).await?;
        }
        Ok(())
    }

    /// Re-rank from tank level and temperature; near the target time the
    /// priority is bumped one level so the work still lands before dark.
    pub async fn adjust_priority(&self) -> Result<()> {
        let (available, temperature) = self.refresh().await?;
        let desired = self.config.desired_temperature;
        let satisfied =
            |level: f32, temp: f32| available >= level && temperature >= temp;
        let new_priority = if !satisfied(50.0, 110.0) {
            Some(Priority::Urgent)
        } else if !satisfied(70.0, 120.0) {
            Some(Priority::High)
        } else if !satisfied(90.0, desired) {
            Some(Priority::Medium)
        } else if !satisfied(100.0, desired) {
            Some(Priority::Low)
        } else {
            None
        };
        let estimate = self.estimate_run_time(available, temperature);
        let mut state = self.state.lock();
        match new_priority {
            Some(priority) => {
                state.has_reached_target = false;
                state.priority = priority;
                let now = Local::now();
                if priority < Priority::Urgent
                    && state
                        .target_time
                        .is_some_and(|target| target > now && target - now < estimate)
                {
                    debug!("Close to the target time, increasing the priority");
                    state.priority = priority.raised();
                }
            }
            None => state.has_reached_target = true,
        }
        Ok(())
    }

    pub fn set_target_time(&self, target: DateTime<Local>) {
        self.state.lock().target_time = Some(target);
    }

    pub fn target_time(&self) -> Option<DateTime<Local>> {
        self.state.lock().target_time
    }

    pub fn power(&self) -> f32 {
        self.config.power
    }
}

#[async_trait]
impl LoadTask for WaterHeaterTask {
    async fn descriptor(&self) -> Result<TaskDescriptor> {
        let state = self.state.lock();
        Ok(TaskDescriptor {
            priority: state.priority,
            power: self.config.power,
            keys: vec![self.config.power_sensor_key.clone()],
            auto_adjust: false,
        })
    }

    async fn start(&self) -> Result<()> {
        if self.is_running().await? {
            return Ok(());
        }
        if self.tank.current_mode().await? == TankMode::Away {
            self.tank.clear_mode(TankMode::Away).await?;
        }
        let (available, temperature) = self.refresh().await?;
        let duration = self
            .estimate_run_time(available, temperature)
            .max(self.min_run_time());
        debug!("Starting for {duration}");
        self.tank.set_mode(TankMode::Boost, duration).await?;
        self.state.lock().started_at = Some(Local::now());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.tank.current_mode().await? == TankMode::Boost {
            self.tank.clear_mode(TankMode::Boost).await?;
        }
        // Inside a scheduled on-window, returning to the timer would turn
        // the heater right back on.
        let now = Local::now().time();
        if let Some((_, end)) = self.on_window_at(now).await? {
            self.tank
                .set_mode(TankMode::Away, end.signed_duration_since(now))
                .await?;
        }
        self.state.lock().started_at = None;
        Ok(())
    }

    async fn is_runnable(&self) -> Result<bool> {
        let state = self.state.lock();
        let benched = state
            .not_runnable_until
            .is_some_and(|until| Local::now() <= until);
        Ok(!benched && !state.has_reached_target)
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.tank.current_mode().await? == TankMode::Boost)
    }

    async fn is_stoppable(&self) -> Result<bool> {
        if !self.is_runnable().await? {
            return Ok(true);
        }
        let running = self.is_running().await?;
        Ok(self.has_been_running_for(running) > self.min_run_time())
    }

    async fn meet_running_criteria(&self, ratio: f32, power: f32) -> Result<bool> {
        debug!("meet_running_criteria({ratio:.3}, {power:.3})");
        let running = self.is_running().await?;
        let (available, temperature) = self.refresh().await?;
        let duration = self.has_been_running_for(running);
        if duration > ChronoDuration::zero() {
            // The heater draws nothing while the tank refills; once past a
            // grace period, no draw means the hardware thermostat is
            // satisfied no matter what the cloud sensors pretend.
            let (min_time, min_power) =
                if available >= 100.0 || duration >= ChronoDuration::minutes(4) {
                    (ChronoDuration::seconds(30), self.config.power / 2.0)
                } else {
                    (ChronoDuration::seconds(90), 0.0)
                };
            if duration > min_time && power <= min_power {
                let mut delay =
                    ChronoDuration::seconds(self.config.no_power_delay_secs as i64);
                if duration > ChronoDuration::minutes(3) {
                    delay = delay * 4;
                }
                debug!("Not drawing enough power, benched for {delay}");
                self.state.lock().not_runnable_until = Some(Local::now() + delay);
                return Ok(false);
            }
        }
        let estimate = self.estimate_run_time(available, temperature);
        let state = self.state.lock();
        // Close to the deadline at URGENT priority, any ratio is accepted:
        // grid power beats a cold shower.
        if state.priority == Priority::Urgent
            && state
                .target_time
                .is_some_and(|target| target - Local::now() < estimate)
        {
            return Ok(true);
        }
        Ok(ratio >= 1.0)
    }

    async fn desc(&self) -> Result<String> {
        let priority = self.state.lock().priority;
        let mut description = format!("WaterHeater({priority}");
        if let Ok((available, temperature)) = self.refresh().await {
            description.push_str(&format!(", {available:.0}%, {temperature:.1}F"));
        }
        description.push(')');
        Ok(description)
    }
}

#[async_trait]
impl Sensor for WaterHeaterTask {
    async fn read(&self, _scale: RecordScale) -> Result<PowerRecord> {
        let (available, temperature) = self.refresh().await?;
        Ok(PowerRecord::from([
            ("temperature", temperature),
            ("available", available),
        ]))
    }

    async fn units(&self, _scale: RecordScale) -> Result<BTreeMap<String, String>> {
        Ok([
            ("temperature".to_owned(), "°F".to_owned()),
            ("available".to_owned(), "%".to_owned()),
        ]
        .into_iter()
        .collect())
    }
}

/// Water heater service loop, once per minute.
pub async fn run_water_heater_service(
    task: Arc<WaterHeaterTask>,
    context: TaskServiceContext,
    production: Arc<dyn ProductionOracle>,
) {
    let uri = TaskRegistry::task_uri(MODULE_NAME);
    context.registry.register(&uri, task.clone());
    info!("Water heater service is now ready to run");
    loop {
        context.watchdog.register(MODULE_NAME);
        context.watchdog.kick(MODULE_NAME);
        context.registry.register(&uri, task.clone());

        match task.refresh().await {
            Ok(_) => {
                context.monitor.track("tank cloud", true);
                context.scheduler.register_task(&uri).await;
            }
            Err(err) => {
                warn!("Self-test failed, unregistering from the scheduler: {err:#}");
                context.monitor.track("tank cloud", false);
                context.scheduler.unregister_task(&uri).await;
            }
        }

        sleep_until_next_minute().await;

        if let Err(err) = task.adjust_priority().await {
            warn!("Could not adjust priority: {err:#}");
        }
        if !context.scheduler.is_on_pause().await
            && let Err(err) = task.prevent_auto_start().await
        {
            debug!("prevent_auto_start() failed: {err:#}");
        }
        let target_passed = task
            .target_time()
            .is_none_or(|target| Local::now() > target);
        if target_passed {
            match production.next_power_window(task.power()).await {
                Ok((_, end)) => {
                    debug!("target_time updated to {end}");
                    task.set_target_time(end);
                }
                Err(err) => debug!("next_power_window() failed: {err:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTank {
        water: Mutex<(f32, f32)>,
        mode: Mutex<TankMode>,
        schedules: Vec<TankSchedule>,
        boosts: AtomicUsize,
        aways: AtomicUsize,
    }

    impl FakeTank {
        fn new(temperature: f32, level: f32) -> Self {
            Self {
                water: Mutex::new((temperature, level)),
                mode: Mutex::new(TankMode::Timer),
                schedules: Vec::new(),
                boosts: AtomicUsize::new(0),
                aways: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TankDevice for FakeTank {
        async fn water(&self) -> Result<(f32, f32)> {
            Ok(*self.water.lock())
        }

        async fn current_mode(&self) -> Result<TankMode> {
            Ok(*self.mode.lock())
        }

        async fn timer_schedules(&self) -> Result<Vec<TankSchedule>> {
            Ok(self.schedules.clone())
        }

        async fn set_mode(&self, mode: TankMode, _duration: ChronoDuration) -> Result<()> {
            match mode {
                TankMode::Boost => {
                    self.boosts.fetch_add(1, Ordering::SeqCst);
                }
                TankMode::Away => {
                    self.aways.fetch_add(1, Ordering::SeqCst);
                }
                TankMode::Timer => {}
            }
            *self.mode.lock() = mode;
            Ok(())
        }

        async fn clear_mode(&self, _mode: TankMode) -> Result<()> {
            *self.mode.lock() = TankMode::Timer;
            Ok(())
        }
    }

    fn config() -> WaterHeaterConfig {
        WaterHeaterConfig {
            power_sensor_key: "water heater".to_owned(),
            power: 4.65,
            minutes_per_degree: 2.0,
            desired_temperature: 125.0,
            min_run_time_secs: 600,
            no_power_delay_secs: 1800,
            tank: sunward_types::TankDriverConfig {
                base_url: String::new(),
                email: String::new(),
                password: String::new(),
                device_id: String::new(),
            },
        }
    }

    fn task_with(tank: FakeTank) -> (Arc<FakeTank>, WaterHeaterTask) {
        let tank = Arc::new(tank);
        let task = WaterHeaterTask::new(tank.clone(), config());
        (tank, task)
    }

    #[tokio::test]
    async fn test_priority_from_cold_empty_tank() {
        // 40 C = 104 F with a near-empty tank: urgent.
        let (_tank, task) = task_with(FakeTank::new(40.0, 0.3));
        task.adjust_priority().await.unwrap();
        let descriptor = task.descriptor().await.unwrap();
        assert_eq!(descriptor.priority, Priority::Urgent);
        assert!(task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn test_target_reached_makes_unrunnable() {
        // 55 C = 131 F with a full tank: nothing left to do.
        let (_tank, task) = task_with(FakeTank::new(55.0, 1.0));
        task.adjust_priority().await.unwrap();
        assert!(!task.is_runnable().await.unwrap());
        // An unrunnable task reports stoppable so a stop can always clean
        // up.
        assert!(task.is_stoppable().await.unwrap());
    }

    #[tokio::test]
    async fn test_pessimistic_envelope_ignores_rising_readings() {
        let (tank, task) = task_with(FakeTank::new(45.0, 0.6));
        let (available, _) = task.refresh().await.unwrap();
        assert_eq!(available, 60.0);
        // The cloud suddenly claims more hot water without any heating:
        // keep the envelope.
        *tank.water.lock() = (50.0, 0.9);
        let (available, temperature) = task.refresh().await.unwrap();
        assert_eq!(available, 60.0);
        assert_eq!(temperature, fahrenheit(45.0));
        // A genuine drop is always accepted.
        *tank.water.lock() = (44.0, 0.5);
        let (available, _) = task.refresh().await.unwrap();
        assert_eq!(available, 50.0);
    }

    #[tokio::test]
    async fn test_start_boosts_for_at_least_min_run_time() {
        let (tank, task) = task_with(FakeTank::new(54.0, 0.95));
        task.start().await.unwrap();
        assert_eq!(tank.boosts.load(Ordering::SeqCst), 1);
        assert!(task.is_running().await.unwrap());
        // Starting again is a no-op.
        task.start().await.unwrap();
        assert_eq!(tank.boosts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_returns_to_timer() {
        let (tank, task) = task_with(FakeTank::new(45.0, 0.6));
        task.start().await.unwrap();
        task.stop().await.unwrap();
        assert_eq!(*tank.mode.lock(), TankMode::Timer);
        assert!(!task.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_no_power_draw_benches_the_task() {
        let (tank, task) = task_with(FakeTank::new(45.0, 1.0));
        // It has been heating for two minutes at a full tank, yet draws
        // nothing: the hardware thermostat is done.
        *tank.mode.lock() = TankMode::Boost;
        task.state.lock().started_at = Some(Local::now() - ChronoDuration::minutes(2));
        let meets = task.meet_running_criteria(1.5, 0.0).await.unwrap();
        assert!(!meets);
        assert!(!task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn test_ratio_gate_when_healthy() {
        let (_tank, task) = task_with(FakeTank::new(45.0, 0.6));
        assert!(task.meet_running_criteria(1.0, 0.0).await.unwrap());
        assert!(!task.meet_running_criteria(0.95, 0.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_urgent_near_target_accepts_any_ratio() {
        let (_tank, task) = task_with(FakeTank::new(40.0, 0.3));
        task.adjust_priority().await.unwrap();
        task.set_target_time(Local::now() + ChronoDuration::minutes(10));
        assert!(task.meet_running_criteria(0.0, 0.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_estimate_run_time_scales_with_deficit() {
        let (_tank, task) = task_with(FakeTank::new(45.0, 0.6));
        let cold = task.estimate_run_time(30.0, 100.0);
        let warm = task.estimate_run_time(90.0, 120.0);
        assert!(cold > warm);
        assert!(warm > ChronoDuration::zero());
    }

}
