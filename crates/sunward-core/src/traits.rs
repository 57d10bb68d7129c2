// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Clear-sky PV production oracle.
///
/// Backed by the production simulator service: a pure function from time
/// (and optionally weather) to expected power. Business logic never sees
/// the irradiance math behind it.
#[async_trait]
pub trait ProductionOracle: Send + Sync {
    /// Expected production at `at`, kW.
    async fn power_at(&self, at: DateTime<Local>) -> Result<f32>;

    /// Peak clear-sky production of the day containing `at`, kW.
    async fn max_available_power_at(&self, at: DateTime<Local>) -> Result<f32>;

    /// Next window during which at least `min_power` kW is expected,
    /// as (start, end).
    async fn next_power_window(&self, min_power: f32)
    -> Result<(DateTime<Local>, DateTime<Local>)>;

    /// Sunrise and sunset of the day containing `at`.
    async fn daytime_at(&self, at: DateTime<Local>) -> Result<(DateTime<Local>, DateTime<Local>)>;
}

/// Instantaneous weather conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConditions {
    /// Outdoor temperature, Fahrenheit.
    pub temperature: f32,
    /// Wind speed, m/s.
    pub wind_speed: f32,
    /// Relative humidity, percent, when the station reports it.
    pub humidity: Option<f32>,
}

/// Weather service oracle.
#[async_trait]
pub trait WeatherOracle: Send + Sync {
    async fn read(&self) -> Result<WeatherConditions>;

    /// Forecast temperature at `at`, Fahrenheit.
    async fn temperature_at(&self, at: DateTime<Local>) -> Result<f32>;

    /// Lowest forecast temperature over the next `hours`, Fahrenheit.
    async fn minimum_temperature(&self, hours: u32) -> Result<f32>;
}

/// Utility rates applicable at a point in time, per kWh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TariffRates {
    pub from_grid: f32,
    pub to_grid: f32,
}

/// Utility tariff oracle. Computed locally from the tariff schedule, so
/// the interface is synchronous and infallible.
pub trait TariffOracle: Send + Sync {
    fn rates_at(&self, at: DateTime<Local>) -> TariffRates;

    fn is_on_peak(&self, at: DateTime<Local>) -> bool;
}

/// Sink for boolean service-health facts.
///
/// Tasks report facts such as "charger cloud reachable"; repeated falses
/// escalate to operator alerts downstream.
pub trait MonitorSink: Send + Sync {
    fn track(&self, name: &str, healthy: bool);
}
