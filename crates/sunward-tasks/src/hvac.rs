// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::models::{HomeModel, HvacModel};
use crate::service::{TaskServiceContext, Ttl};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use sunward_core::{
    LoadTask, MonitorSink, ProductionOracle, SchedulerControl, Sensor, TaskRegistry,
    WeatherOracle, sleep_until_next_minute,
};
use sunward_types::{HvacConfig, PowerRecord, Priority, RecordScale, TaskDescriptor};
use tracing::{debug, info, warn};

pub const MODULE_NAME: &str = "hvac";

/// Thermostat operating mode. The sign points the direction the mode can
/// move the indoor temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatMode {
    Cool,
    Auto,
    Heat,
}

impl ThermostatMode {
    pub fn sign(self) -> f32 {
        match self {
            Self::Cool => -1.0,
            Self::Auto => 0.0,
            Self::Heat => 1.0,
        }
    }

    fn accepts(self, mode: ThermostatMode) -> bool {
        self == Self::Auto || self == mode
    }
}

/// Thermostat surface the task needs.
#[async_trait]
pub trait ThermostatDevice: Send + Sync {
    /// Equipment currently running, e.g. "compCool1,fan". Empty when idle.
    async fn equipment_status(&self) -> Result<String>;

    /// Configured mode; `None` when the thermostat is off.
    async fn hvac_mode(&self) -> Result<Option<ThermostatMode>>;

    async fn has_active_hold(&self) -> Result<bool>;

    /// Temperatures of the paired remote sensors, Fahrenheit.
    async fn temperatures(&self) -> Result<BTreeMap<String, f32>>;

    async fn set_hold(&self, hours: u32, heat_temp: f32, cool_temp: f32) -> Result<()>;

    async fn resume_program(&self) -> Result<()>;
}

/// Cloud thermostat with a short-lived snapshot cache in front.
pub struct CachedThermostat {
    client: sunward_adapters::ThermostatClient,
    status: Ttl<String>,
    mode: Ttl<Option<ThermostatMode>>,
    hold: Ttl<bool>,
    temperatures: Ttl<BTreeMap<String, f32>>,
}

impl std::fmt::Debug for CachedThermostat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedThermostat").finish()
    }
}

impl CachedThermostat {
    pub fn new(client: sunward_adapters::ThermostatClient) -> Self {
        let ttl = Duration::from_secs(3);
        Self {
            client,
            status: Ttl::new(ttl),
            mode: Ttl::new(ttl),
            hold: Ttl::new(ttl),
            temperatures: Ttl::new(ttl),
        }
    }
}

#[async_trait]
impl ThermostatDevice for CachedThermostat {
    async fn equipment_status(&self) -> Result<String> {
        if let Some(status) = self.status.get() {
            return Ok(status);
        }
        let status = self.client.equipment_status().await?;
        self.status.put(status.clone());
        Ok(status)
    }

    async fn hvac_mode(&self) -> Result<Option<ThermostatMode>> {
        if let Some(mode) = self.mode.get() {
            return Ok(mode);
        }
        let mode = match self.client.hvac_mode().await?.as_str() {
            "cool" => Some(ThermostatMode::Cool),
            "heat" => Some(ThermostatMode::Heat),
            "auto" => Some(ThermostatMode::Auto),
            _ => None,
        };
        self.mode.put(mode);
        Ok(mode)
    }

    async fn has_active_hold(&self) -> Result<bool> {
        if let Some(hold) = self.hold.get() {
            return Ok(hold);
        }
        let hold = self
            .client
            .events()
            .await?
            .iter()
            .any(|event| event.event_type == "hold" && event.running);
        self.hold.put(hold);
        Ok(hold)
    }

    async fn temperatures(&self) -> Result<BTreeMap<String, f32>> {
        if let Some(temperatures) = self.temperatures.get() {
            return Ok(temperatures);
        }
        let temperatures: BTreeMap<String, f32> = self
            .client
            .remote_sensors()
            .await?
            .into_iter()
            .filter_map(|sensor| sensor.temperature.map(|temp| (sensor.name, temp)))
            .collect();
        self.temperatures.put(temperatures.clone());
        Ok(temperatures)
    }

    async fn set_hold(&self, hours: u32, heat_temp: f32, cool_temp: f32) -> Result<()> {
        self.client.set_hold(hours, heat_temp, cool_temp).await?;
        self.hold.invalidate();
        self.status.invalidate();
        Ok(())
    }

    async fn resume_program(&self) -> Result<()> {
        self.client.resume_program().await?;
        self.hold.invalidate();
        self.status.invalidate();
        Ok(())
    }
}

/// Planner outputs, published as an immutable snapshot behind a lock.
#[derive(Debug, Clone)]
pub struct PlannerData {
    /// Peak clear-sky power the plant should deliver, kW.
    pub max_available_power: f32,
    /// Current outdoor temperature, Fahrenheit.
    pub outdoor_temp: f32,
    /// Last moment the plant still produces enough to run the HVAC.
    pub target_time: DateTime<Local>,
    curve_start: DateTime<Local>,
    /// Minute-resolution optimal temperature curve from `curve_start`.
    curve: Vec<f32>,
}

impl PlannerData {
    pub fn new(
        max_available_power: f32,
        outdoor_temp: f32,
        target_time: DateTime<Local>,
        curve_start: DateTime<Local>,
        curve: Vec<f32>,
    ) -> Self {
        Self {
            max_available_power,
            outdoor_temp,
            target_time,
            curve_start,
            curve,
        }
    }

    /// Optimal temperature the home should passively be at `at`.
    pub fn temperature_at(&self, at: DateTime<Local>) -> f32 {
        if self.curve.is_empty() {
            return self.outdoor_temp;
        }
        let minute = (at - self.curve_start)
            .num_minutes()
            .clamp(0, self.curve.len() as i64 - 1) as usize;
        self.curve[minute]
    }

    pub fn optimal_temp(&self) -> f32 {
        self.temperature_at(Local::now())
    }

    pub fn target_temp(&self) -> f32 {
        self.temperature_at(self.target_time)
    }
}

pub type PlannerHandle = Arc<RwLock<Option<PlannerData>>>;

/// Background planner feeding the HVAC task.
///
/// Some of its inputs take seconds to collect, so it runs on its own and
/// publishes a snapshot the control loop reads under a lock: the maximum
/// available production, the target time (when production can no longer
/// carry the HVAC), and the passive "optimal temperature" curve that,
/// followed with no HVAC at all, lands on the goal temperature at goal
/// time.
pub struct HvacPlanner {
    weather: Arc<dyn WeatherOracle>,
    production: Arc<dyn ProductionOracle>,
    goal_time: NaiveTime,
    goal_temperature: f32,
    hvac_model: HvacModel,
    home_model: HomeModel,
    data: PlannerHandle,
}

impl std::fmt::Debug for HvacPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HvacPlanner").finish()
    }
}

const PLANNER_REFRESH: Duration = Duration::from_secs(10 * 60);
const PLANNER_RETRY: Duration = Duration::from_secs(20);

fn at_time(day: DateTime<Local>, time: NaiveTime) -> DateTime<Local> {
    day.date_naive()
        .and_time(time)
        .and_local_timezone(Local)
        .earliest()
        .unwrap_or(day)
}

impl HvacPlanner {
    pub fn new(
        weather: Arc<dyn WeatherOracle>,
        production: Arc<dyn ProductionOracle>,
        config: &HvacConfig,
    ) -> Self {
        let goal_time = NaiveTime::parse_from_str(&config.goal_time, "%H:%M")
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(22, 30, 0).unwrap_or_default());
        Self {
            weather,
            production,
            goal_time,
            goal_temperature: config.goal_temperature,
            hvac_model: HvacModel,
            home_model: HomeModel,
            data: Arc::new(RwLock::new(None)),
        }
    }

    pub fn handle(&self) -> PlannerHandle {
        self.data.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.data.read().is_some()
    }

    pub async fn run(self) {
        loop {
            match self.update().await {
                Ok(()) => futures_timer::Delay::new(PLANNER_REFRESH).await,
                Err(err) => {
                    warn!("HVAC parameter update failed: {err:#}");
                    futures_timer::Delay::new(PLANNER_RETRY).await;
                }
            }
        }
    }

    async fn update(&self) -> Result<()> {
        let previous = self.data.read().clone();
        let now = Local::now();
        let (max_available_power, target_time) = match previous {
            Some(ref data) if now <= at_time(data.target_time, self.goal_time) => {
                (data.max_available_power, data.target_time)
            }
            _ => {
                let tomorrow = at_time(
                    now + ChronoDuration::days(1),
                    NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default(),
                );
                // Shave an epsilon so "at least this much" queries do not
                // land exactly on the peak.
                let max = self.production.max_available_power_at(tomorrow).await? - 0.0001;
                let target = self.compute_target_time(max).await?;
                debug!("max_available_power updated to {max:.3}");
                debug!("Target time updated to {target}");
                (max, target)
            }
        };

        let outdoor_temp = self.weather.read().await?.temperature;
        let goal = at_time(target_time, self.goal_time);
        let curve = self.compute_passive_curve(now, goal).await?;
        *self.data.write() = Some(PlannerData::new(
            max_available_power,
            outdoor_temp,
            target_time,
            now,
            curve,
        ));
        Ok(())
    }

    /// Fixed point of "when does production stop covering the HVAC draw":
    /// the window depends on the power, and the power depends on the
    /// outdoor temperature at the window end.
    async fn compute_target_time(&self, mut power: f32) -> Result<DateTime<Local>> {
        let mut target = Local::now();
        for _ in 0..10 {
            let (_, window_end) = self.production.next_power_window(power).await?;
            target = window_end;
            let temp_at_target = self.weather.temperature_at(target).await?;
            let hvac_power = self.hvac_model.power(temp_at_target);
            if hvac_power >= power {
                return Ok(target);
            }
            power = hvac_power;
        }
        Ok(target)
    }

    /// Shooting iteration: find the start temperature whose passive drift
    /// lands on the goal temperature at `end`, and return the per-minute
    /// trajectory.
    async fn compute_passive_curve(
        &self,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Result<Vec<f32>> {
        let minutes = (end - start).num_minutes();
        if minutes <= 1 {
            anyhow::bail!("not enough time to estimate a passive curve");
        }
        let minutes = minutes as usize;
        // Forecast lookups dominate the cost; sample coarsely and hold the
        // outdoor temperature constant within each step.
        let step = (minutes / 20).max(1);
        let mut samples = Vec::with_capacity(minutes / step + 1);
        let mut minute = 0;
        while minute < minutes {
            let midpoint = start + ChronoDuration::minutes((minute + step / 2) as i64);
            samples.push(self.weather.temperature_at(midpoint).await?);
            minute += step;
        }

        let mut start_temp = self.goal_temperature;
        let mut curve = Vec::with_capacity(minutes);
        for _ in 0..40 {
            curve.clear();
            let mut temperature = start_temp;
            for minute in 0..minutes {
                curve.push(temperature);
                let outdoor = samples[(minute / step).min(samples.len() - 1)];
                temperature += self.home_model.degree_per_minute(temperature, outdoor);
            }
            let deviation = self.goal_temperature - temperature;
            if deviation.abs() < 0.1 {
                break;
            }
            start_temp += deviation * 2.0 / 3.0;
        }
        debug!(
            "Passive curve: {:.2}F at {start} drifts to {:.2}F at {end}",
            curve.first().copied().unwrap_or(self.goal_temperature),
            curve.last().copied().unwrap_or(self.goal_temperature),
        );
        Ok(curve)
    }
}

#[derive(Debug, Default)]
struct HvacRunState {
    power: f32,
    priority: Priority,
    started_at: Option<DateTime<Local>>,
    stopped_at: Option<DateTime<Local>>,
}

/// Thermostat-driven HVAC task.
///
/// The task never rewrites the thermostat program. It expects the program
/// to park the comfort setpoints at unreachable values during production
/// hours, and it places bounded holds at the planner's optimal
/// temperature (plus an offset) whenever surplus power allows, so the
/// home banks free heating or cooling before the sun drops off.
pub struct HvacTask {
    thermostat: Arc<dyn ThermostatDevice>,
    config: HvacConfig,
    planner: PlannerHandle,
    model: HvacModel,
    state: Mutex<HvacRunState>,
}

impl std::fmt::Debug for HvacTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HvacTask").finish()
    }
}

impl HvacTask {
    pub fn new(
        thermostat: Arc<dyn ThermostatDevice>,
        planner: PlannerHandle,
        config: HvacConfig,
    ) -> Self {
        let model = HvacModel;
        let state = HvacRunState {
            power: model.power(75.0),
            ..HvacRunState::default()
        };
        Self {
            thermostat,
            config,
            planner,
            model,
            state: Mutex::new(state),
        }
    }

    fn planner_data(&self) -> Result<PlannerData> {
        self.planner
            .read()
            .clone()
            .context("the HVAC planner has not produced parameters yet")
    }

    fn min_run_time(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.min_run_time_secs as i64)
    }

    async fn indoor_temp(&self) -> Result<f32> {
        let sensor = &self.config.temperature_sensor;
        self.thermostat
            .temperatures()
            .await?
            .get(sensor)
            .copied()
            .with_context(|| format!("{sensor} temperature is not available"))
    }

    fn clamp_comfort(&self, temperature: f32) -> f32 {
        temperature.clamp(self.config.comfort_range[0], self.config.comfort_range[1])
    }

    /// Indoor deviation from the optimal (or target) temperature.
    /// Positive means the home is warmer than it should be.
    async fn deviation(&self, target: bool, comfort: bool) -> Result<f32> {
        let data = self.planner_data()?;
        let mut temperature = if target {
            data.target_temp()
        } else {
            data.optimal_temp()
        };
        if comfort {
            temperature = self.clamp_comfort(temperature);
        }
        Ok(self.indoor_temp().await? - temperature)
    }

    /// The mode that would move the home toward the desired temperature,
    /// within what the thermostat is configured to do.
    async fn next_helpful_mode(
        &self,
        target: bool,
        comfort: bool,
    ) -> Result<Option<ThermostatMode>> {
        let deviation = self.deviation(target, comfort).await?;
        if deviation == 0.0 {
            return Ok(None);
        }
        let Some(configured) = self.thermostat.hvac_mode().await? else {
            return Ok(None);
        };
        for mode in [ThermostatMode::Heat, ThermostatMode::Cool] {
            if configured.accepts(mode) && deviation * mode.sign() < 0.0 {
                return Ok(Some(mode));
            }
        }
        Ok(None)
    }

    async fn estimate_runtime(&self, target: bool, comfort: bool) -> Result<ChronoDuration> {
        if self.next_helpful_mode(target, comfort).await?.is_none() {
            return Ok(ChronoDuration::zero());
        }
        let deviation = self.deviation(target, comfort).await?;
        let pace = self.model.minutes_per_degree(self.planner_data()?.outdoor_temp);
        Ok(ChronoDuration::minutes(
            (pace * deviation.abs()) as i64,
        ))
    }

    fn has_been_running_for(&self, running: bool) -> ChronoDuration {
        let mut state = self.state.lock();
        if running {
            let started_at = *state.started_at.get_or_insert_with(Local::now);
            Local::now() - started_at
        } else {
            ChronoDuration::zero()
        }
    }

    fn is_in_comfort_range(&self, indoor: f32) -> bool {
        indoor >= self.config.comfort_range[0] && indoor <= self.config.comfort_range[1]
    }

    /// Refresh the power requirement from the model at the current
    /// outdoor temperature.
    pub fn adjust_power(&self) -> Result<()> {
        let data = self.planner_data()?;
        self.state.lock().power = self.model.power(data.outdoor_temp);
        Ok(())
    }

    /// Re-rank from the number of estimated runs left before the target
    /// time; leaving the comfort band bumps the level.
    pub async fn adjust_priority(&self) -> Result<()> {
        let data = self.planner_data()?;
        let now = Local::now();
        if now > data.target_time {
            self.state.lock().priority = Priority::Low;
            return Ok(());
        }
        let run_time = self
            .estimate_runtime(true, true)
            .await?
            .max(ChronoDuration::seconds(1));
        let count =
            (data.target_time - now).num_seconds() as f32 / run_time.num_seconds() as f32;
        let mut priority = if !(0.0..=4.0).contains(&count) {
            Priority::Low
        } else {
            Priority::from_level((4 - count.floor() as i64).clamp(1, 4) as u8)
                .unwrap_or(Priority::Low)
        };
        let indoor = self.indoor_temp().await?;
        if !self.is_in_comfort_range(indoor) && priority < Priority::Urgent {
            priority = priority.raised();
        }
        self.state.lock().priority = priority;
        Ok(())
    }
}

#[async_trait]
impl LoadTask for HvacTask {
    async fn descriptor(&self) -> Result<TaskDescriptor> {
        let state = self.state.lock();
        Ok(TaskDescriptor {
            priority: state.priority,
            power: state.power,
            keys: self.config.power_sensor_keys.clone(),
            auto_adjust: false,
        })
    }

    async fn start(&self) -> Result<()> {
        let Some(mode) = self.next_helpful_mode(false, true).await? else {
            debug!("No mode can move the temperature the right way");
            return Ok(());
        };
        let duration = self.estimate_runtime(false, true).await?;
        let target = self.planner_data()?.optimal_temp()
            + mode.sign() * self.config.temperature_offset;
        // Hold for about twice the estimate so a cloudy stretch does not
        // hand control back to the program mid-run.
        let hold_hours = ((duration.num_seconds() * 2) as f32 / 3600.0).ceil() as u32;
        debug!("Starting for {duration} with the thermostat held at {target:.1}F");
        self.thermostat
            .set_hold(hold_hours.max(1), target, target + mode.sign() * 2.0)
            .await?;
        self.state.lock().started_at = Some(Local::now());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.thermostat.resume_program().await?;
        let mut state = self.state.lock();
        state.started_at = None;
        state.stopped_at = Some(Local::now());
        Ok(())
    }

    async fn is_runnable(&self) -> Result<bool> {
        let min_pause = ChronoDuration::seconds(self.config.min_pause_secs as i64);
        let paused_until = self.state.lock().stopped_at.map(|at| at + min_pause);
        if paused_until.is_some_and(|until| Local::now() < until) {
            return Ok(false);
        }
        let Some(mode) = self.thermostat.hvac_mode().await? else {
            return Ok(false);
        };
        if self.deviation(false, false).await? * mode.sign() > 0.0 {
            return Ok(false);
        }
        let indoor = self.indoor_temp().await?;
        if mode == ThermostatMode::Heat && indoor >= self.config.comfort_range[1] {
            return Ok(false);
        }
        if mode == ThermostatMode::Cool && indoor <= self.config.comfort_range[0] {
            return Ok(false);
        }
        Ok(true)
    }

    async fn is_running(&self) -> Result<bool> {
        let status = self.thermostat.equipment_status().await?;
        if !status.is_empty() && status != "fan" {
            return Ok(true);
        }
        self.thermostat.has_active_hold().await
    }

    async fn is_stoppable(&self) -> Result<bool> {
        let running = self.is_running().await?;
        if self.has_been_running_for(running) > self.min_run_time() {
            return self.thermostat.has_active_hold().await;
        }
        Ok(false)
    }

    async fn meet_running_criteria(&self, ratio: f32, power: f32) -> Result<bool> {
        debug!("meet_running_criteria({ratio:.3}, {power:.3})");
        let data = self.planner_data()?;
        let self_power = self.state.lock().power;
        let run_time = self
            .estimate_runtime(true, true)
            .await?
            .max(ChronoDuration::seconds(1));
        let min_ratio = (0.95 * data.max_available_power / self_power).min(1.0);
        let remaining = data.target_time - Local::now();
        if remaining > ChronoDuration::zero() && remaining < run_time {
            // Close to the deadline, relax the bar quadratically with the
            // time left.
            let coefficient =
                remaining.num_seconds() as f32 / run_time.num_seconds() as f32;
            return Ok(ratio >= min_ratio * coefficient * coefficient);
        }
        if self.is_running().await? {
            let mode_sign = self
                .thermostat
                .hvac_mode()
                .await?
                .map(ThermostatMode::sign)
                .unwrap_or(0.0);
            if self.deviation(false, true).await? * mode_sign > 0.0 {
                debug!("Target has been reached");
                return Ok(false);
            }
            if self.has_been_running_for(true) > self.min_run_time() {
                return Ok(power > 0.0
                    && ratio >= (0.9 * data.max_available_power / power).min(1.0)
                    && power > self_power / 3.0);
            }
            return Ok(true);
        }
        Ok(ratio >= min_ratio)
    }

    async fn desc(&self) -> Result<String> {
        let (priority, power) = {
            let state = self.state.lock();
            (state.priority, state.power)
        };
        let mut description = format!("HVAC({priority}");
        if let Ok(indoor) = self.indoor_temp().await {
            description.push_str(&format!(", {indoor:.1}F"));
        }
        description.push_str(&format!(", {power:.1} kW)"));
        Ok(description)
    }
}

#[async_trait]
impl Sensor for HvacTask {
    async fn read(&self, _scale: RecordScale) -> Result<PowerRecord> {
        let temperatures = self.thermostat.temperatures().await?;
        Ok(temperatures.into_iter().collect())
    }

    async fn units(&self, _scale: RecordScale) -> Result<BTreeMap<String, String>> {
        Ok(self
            .thermostat
            .temperatures()
            .await?
            .into_keys()
            .map(|name| (name, "°F".to_owned()))
            .collect())
    }
}

/// HVAC service loop, once per minute.
pub async fn run_hvac_service(task: Arc<HvacTask>, context: TaskServiceContext) {
    let uri = TaskRegistry::task_uri(MODULE_NAME);
    context.registry.register(&uri, task.clone());
    info!("HVAC service is now ready to run");
    loop {
        if let Err(err) = task.adjust_power() {
            debug!("{err:#}");
        }
        if let Err(err) = task.adjust_priority().await {
            debug!("Could not adjust priority: {err:#}");
        }

        context.watchdog.register(MODULE_NAME);
        context.watchdog.kick(MODULE_NAME);
        context.registry.register(&uri, task.clone());

        match task.thermostat.temperatures().await {
            Ok(_) => {
                context.monitor.track("thermostat cloud", true);
                context.scheduler.register_task(&uri).await;
            }
            Err(err) => {
                warn!("Self-test failed, unregistering from the scheduler: {err:#}");
                context.monitor.track("thermostat cloud", false);
                context.scheduler.unregister_task(&uri).await;
            }
        }

        sleep_until_next_minute().await;
    }
}
