// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::service::{TaskServiceContext, Ttl};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Local, Weekday};
use std::sync::Arc;
use std::time::Duration;
use sunward_adapters::{CarStateClient, ChargerState, PulseChargerClient};
use sunward_core::{LoadTask, MonitorSink, SchedulerControl, SensorReader, TaskRegistry};
use sunward_types::{CarChargerConfig, PowerRecord, Priority, RecordScale, TaskDescriptor};
use tracing::{debug, info, warn};

pub const MODULE_NAME: &str = "car_charger";

/// Kilowatts drawn per ampere of charging current at 240 V.
const KW_PER_AMPERE: f32 = 0.237;

/// One EVSE and the car plugged into it.
///
/// The charger declares its current limits; the car contributes the state
/// of charge used for priority ranking.
#[async_trait]
pub trait Charger: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn is_charging(&self) -> Result<bool>;

    async fn is_plugged_in(&self) -> Result<bool>;

    async fn state_of_charge(&self) -> Result<f32>;

    /// Charge target; the car will not accept a charge above it.
    fn max_state_of_charge(&self) -> f32;

    fn min_charging_current(&self) -> u32;

    async fn max_charging_current(&self) -> Result<u32>;

    async fn charging_current(&self) -> Result<u32>;

    async fn set_charging_current(&self, current: u32) -> Result<()>;

    /// Override of the LOW-priority state-of-charge threshold, when the
    /// driver wants one. `None` derives it from the charge target.
    fn low_priority_threshold(&self) -> Option<f32>;
}

/// Pulse-cloud charger paired with the car telemetry sensor.
pub struct PulseCharger {
    name: String,
    client: PulseChargerClient,
    car: CarStateClient,
    max_state_of_charge: f32,
    state: Ttl<ChargerState>,
}

impl std::fmt::Debug for PulseCharger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseCharger").field("name", &self.name).finish()
    }
}

impl PulseCharger {
    pub fn new(
        name: impl Into<String>,
        client: PulseChargerClient,
        car: CarStateClient,
        max_state_of_charge: f32,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            car,
            max_state_of_charge,
            state: Ttl::new(Duration::from_secs(15)),
        }
    }

    async fn state(&self) -> Result<ChargerState> {
        if let Some(state) = self.state.get() {
            return Ok(state);
        }
        let state = self.client.state().await?;
        self.state.put(state.clone());
        Ok(state)
    }
}

#[async_trait]
impl Charger for PulseCharger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        self.client.resume_charging_session().await?;
        self.state.invalidate();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.client.pause_charging_session().await?;
        // Drop back to the floor so the next session starts conservatively.
        self.client
            .set_max_charging_current(self.min_charging_current())
            .await?;
        self.state.invalidate();
        Ok(())
    }

    async fn is_charging(&self) -> Result<bool> {
        Ok(self.state().await?.is_charging())
    }

    async fn is_plugged_in(&self) -> Result<bool> {
        Ok(self.state().await?.is_plugged_in())
    }

    async fn state_of_charge(&self) -> Result<f32> {
        Ok(self.car.state_of_charge().await?)
    }

    fn max_state_of_charge(&self) -> f32 {
        self.max_state_of_charge
    }

    fn min_charging_current(&self) -> u32 {
        6
    }

    async fn max_charging_current(&self) -> Result<u32> {
        Ok(self.state().await?.config_data.max_available_current)
    }

    async fn charging_current(&self) -> Result<u32> {
        Ok(self.state().await?.config_data.max_charging_current)
    }

    async fn set_charging_current(&self, current: u32) -> Result<()> {
        self.client.set_max_charging_current(current).await?;
        self.state.invalidate();
        Ok(())
    }

    fn low_priority_threshold(&self) -> Option<f32> {
        // The commute car rests on weekends: let it fill up to the charge
        // target instead of idling at LOW.
        match Local::now().weekday() {
            Weekday::Sat | Weekday::Sun => Some(self.max_state_of_charge),
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri => None,
        }
    }
}

/// Task handling car charging.
///
/// Auto-adjust: the declared power is the 6 A floor, and an independent
/// fast loop scales the current up into whatever surplus the window
/// reports while the task runs.
pub struct CarChargerTask {
    charger: Arc<dyn Charger>,
    power_sensor_key: String,
}

impl std::fmt::Debug for CarChargerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarChargerTask")
            .field("charger", &self.charger.name())
            .finish()
    }
}

impl CarChargerTask {
    pub fn new(charger: Arc<dyn Charger>, config: &CarChargerConfig) -> Self {
        Self {
            charger,
            power_sensor_key: config.power_sensor_key.clone(),
        }
    }

    async fn can_charge(&self) -> Result<bool> {
        let state_of_charge = self.charger.state_of_charge().await?;
        Ok(state_of_charge < self.charger.max_state_of_charge())
    }

    async fn priority(&self) -> Result<Priority> {
        if !self.charger.is_plugged_in().await? || !self.can_charge().await? {
            return Ok(Priority::Low);
        }
        let state_of_charge = self.charger.state_of_charge().await?;
        // The higher the requested charge target, the higher the MEDIUM
        // threshold sits below it.
        let max = self.charger.max_state_of_charge();
        let low = self
            .charger
            .low_priority_threshold()
            .unwrap_or(max - (100.0 - max) / 2.0);
        if state_of_charge < 33.0 {
            Ok(Priority::Urgent)
        } else if state_of_charge < 55.0 {
            Ok(Priority::High)
        } else if state_of_charge < low {
            Ok(Priority::Medium)
        } else {
            Ok(Priority::Low)
        }
    }

    /// Ampere setting appropriate for `power` kW of surplus.
    async fn current_rate_for(&self, power: f32) -> Result<u32> {
        let rate = ((power / KW_PER_AMPERE) as i64).max(0) as u32;
        let rate = rate.max(self.charger.min_charging_current());
        Ok(rate.min(self.charger.max_charging_current().await?))
    }

    /// Track the instantaneous surplus with the charging current.
    pub async fn adjust_charge_rate(&self, record: &PowerRecord) -> Result<()> {
        let usage = record.sum_of(&[self.power_sensor_key.clone()]);
        let available = -(record.net() - usage);
        let current = self.current_rate_for(available).await?;
        if self.charger.charging_current().await? != current {
            debug!("Adjusting to {current}A ({available:.2} kW available)");
            self.charger.set_charging_current(current).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LoadTask for CarChargerTask {
    async fn descriptor(&self) -> Result<TaskDescriptor> {
        Ok(TaskDescriptor {
            priority: self.priority().await?,
            power: self.charger.min_charging_current() as f32 * KW_PER_AMPERE,
            keys: vec![self.power_sensor_key.clone()],
            auto_adjust: true,
        })
    }

    async fn start(&self) -> Result<()> {
        debug!("Starting {}", self.charger.name());
        self.charger.start().await
    }

    async fn stop(&self) -> Result<()> {
        debug!("Stopping {}", self.charger.name());
        self.charger.stop().await
    }

    async fn is_runnable(&self) -> Result<bool> {
        Ok(self.charger.is_plugged_in().await? && self.can_charge().await?)
    }

    async fn is_running(&self) -> Result<bool> {
        self.charger.is_charging().await
    }

    async fn is_stoppable(&self) -> Result<bool> {
        Ok(true)
    }

    async fn meet_running_criteria(&self, ratio: f32, power: f32) -> Result<bool> {
        debug!("meet_running_criteria({ratio:.3}, {power:.3})");
        if !self.is_runnable().await? {
            return Ok(false);
        }
        if self.is_running().await? {
            Ok(ratio >= 0.9)
        } else {
            Ok(ratio >= 1.0)
        }
    }

    async fn desc(&self) -> Result<String> {
        let priority = self.priority().await?;
        let mut description = format!("CarCharger({priority}, {}", self.charger.name());
        if let Ok(state_of_charge) = self.charger.state_of_charge().await {
            description.push_str(&format!(", {state_of_charge:.1}%"));
        }
        description.push(')');
        Ok(description)
    }
}

/// Car charger service loop.
///
/// Runs on the fast `cycle_length` period: heartbeat, re-register,
/// self-test against the charger cloud, and, when the task is running,
/// adjust the charge rate to the instantaneous surplus.
pub async fn run_car_charger_service(
    task: Arc<CarChargerTask>,
    context: TaskServiceContext,
    power: SensorReader,
    simulator: SensorReader,
    cycle_length: Duration,
) {
    let uri = TaskRegistry::task_uri(MODULE_NAME);
    context.registry.register(&uri, task.clone());
    info!("Car charger service is now ready to run");
    loop {
        context.watchdog.register(MODULE_NAME);
        context.watchdog.kick(MODULE_NAME);
        context.registry.register(&uri, task.clone());

        // Self-test: on basic operation failure, leave the scheduler alone
        // with the tasks it can actually control.
        match task.charger.is_charging().await {
            Ok(_) => {
                context.monitor.track("charger cloud", true);
                context.scheduler.register_task(&uri).await;
            }
            Err(err) => {
                warn!("Self-test failed, unregistering from the scheduler: {err:#}");
                context.monitor.track("charger cloud", false);
                context.scheduler.unregister_task(&uri).await;
            }
        }

        futures_timer::Delay::new(cycle_length).await;

        if !task.is_running().await.unwrap_or(false) {
            continue;
        }
        let mut record = power.read(RecordScale::Second).await;
        if record.is_none() {
            debug!("No new power record, using the simulator");
            record = simulator.read(RecordScale::Second).await;
        }
        let Some(record) = record else {
            debug!("Failed to get a record from the simulator");
            continue;
        };
        if let Err(err) = task.adjust_charge_rate(&record).await {
            warn!("adjust_charge_rate() failed: {err:#}");
        }
    }
}
