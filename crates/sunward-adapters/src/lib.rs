// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

pub mod car_state;
pub mod energy_monitor;
pub mod errors;
pub mod evse;
pub mod simulator;
pub mod switch;
pub mod tank;
pub mod tariff;
pub mod thermostat;
pub mod weather;

pub use car_state::CarStateClient;
pub use energy_monitor::EnergyMonitorClient;
pub use errors::{AdapterError, AdapterResult};
pub use evse::{ChargerState, PulseChargerClient};
pub use simulator::ProductionSimulatorClient;
pub use switch::{SwitchClient, SwitchDevice};
pub use tank::{TankClient, TankMode, TankSchedule, TankWaterState};
pub use tariff::TariffSchedule;
pub use thermostat::{RemoteSensorReading, ThermostatClient, ThermostatEvent};
pub use weather::WeatherClient;
