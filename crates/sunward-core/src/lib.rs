// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

pub mod registry;
pub mod scheduler;
pub mod sensor;
pub mod store;
pub mod task;
pub mod traits;
pub mod watchdog;
pub mod window;

pub use registry::TaskRegistry;
pub use scheduler::{
    Scheduler, SchedulerClient, SchedulerControl, SchedulerSettings, run_scheduler_service,
    sleep_until_next_minute,
};
pub use sensor::{Sensor, SensorReader};
pub use store::Store;
pub use task::LoadTask;
pub use traits::{
    MonitorSink, ProductionOracle, TariffOracle, TariffRates, WeatherConditions, WeatherOracle,
};
pub use watchdog::{Watchdog, WatchdogHandle};
pub use window::PowerUsageWindow;
