// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

pub mod car_charger;
pub mod hvac;
pub mod models;
pub mod pool_pump;
pub mod service;
pub mod water_heater;

pub use car_charger::{CarChargerTask, Charger, PulseCharger, run_car_charger_service};
pub use hvac::{
    CachedThermostat, HvacPlanner, HvacTask, PlannerData, PlannerHandle, ThermostatDevice,
    ThermostatMode, run_hvac_service,
};
pub use models::{HomeModel, HvacModel};
pub use pool_pump::{CloudPoolSwitch, PoolPumpTask, PoolSwitch, run_pool_pump_service};
pub use service::TaskServiceContext;
pub use water_heater::{TankDevice, WaterHeaterTask, run_water_heater_service};
