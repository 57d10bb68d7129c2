// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

pub mod config;
pub mod priority;
pub mod record;
pub mod task;

pub use config::{
    CarChargerConfig, ChargerDriverConfig, EnergyMonitorConfig, HvacConfig, PoolPumpConfig,
    SchedulerConfig, SimulatorConfig, SunwardConfig, SwitchDriverConfig, SystemConfig,
    TankDriverConfig, TariffConfig, ThermostatDriverConfig, WaterHeaterConfig, WeatherConfig,
};
pub use priority::{Priority, mean_level};
pub use record::{NET_CHANNEL, PowerRecord, RecordScale, SOLAR_CHANNEL};
pub use task::{TaskDescriptor, importance_cmp};
