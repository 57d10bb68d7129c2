// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use serde::Deserialize;

/// Top-level configuration, one TOML file.
///
/// Task sections are optional; a missing section means the corresponding
/// service is not started.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SunwardConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub energy_monitor: EnergyMonitorConfig,
    #[serde(default)]
    pub production_simulator: SimulatorConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub tariff: TariffConfig,
    pub car_charger: Option<CarChargerConfig>,
    pub water_heater: Option<WaterHeaterConfig>,
    pub hvac: Option<HvacConfig>,
    pub pool_pump: Option<PoolPumpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Bind address of the operator API.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path of the key/value store database.
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store_path: default_store_path(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8095".to_owned()
}

fn default_store_path() -> String {
    "sunward.db".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Number of minute records kept in the power-usage sliding window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Power values inside (0, threshold) kW are squashed to zero on ingest.
    #[serde(default = "default_ignore_power_threshold")]
    pub ignore_power_threshold: f32,

    /// Minutes without any real power record before the simulator fallback
    /// and, failing that, paused mode.
    #[serde(default = "default_max_record_gap")]
    pub max_record_gap_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            ignore_power_threshold: default_ignore_power_threshold(),
            max_record_gap_minutes: default_max_record_gap(),
        }
    }
}

fn default_window_size() -> usize {
    12
}

fn default_ignore_power_threshold() -> f32 {
    0.1
}

fn default_max_record_gap() -> i64 {
    3
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnergyMonitorConfig {
    #[serde(default = "default_monitor_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_monitor_url() -> String {
    "http://127.0.0.1:8810".to_owned()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_simulator_url")]
    pub base_url: String,
}

fn default_simulator_url() -> String {
    "http://127.0.0.1:8811".to_owned()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_weather_url")]
    pub base_url: String,
}

fn default_weather_url() -> String {
    "http://127.0.0.1:8812".to_owned()
}

/// Utility tariff model: flat import/export rates with a seasonal weekday
/// on-peak window carrying a higher import rate.
#[derive(Debug, Clone, Deserialize)]
pub struct TariffConfig {
    #[serde(default = "default_import_rate")]
    pub import_rate: f32,
    #[serde(default = "default_on_peak_import_rate")]
    pub on_peak_import_rate: f32,
    #[serde(default = "default_export_rate")]
    pub export_rate: f32,

    /// Months (1-12) during which the on-peak window applies.
    #[serde(default = "default_on_peak_months")]
    pub on_peak_months: Vec<u32>,

    /// On-peak window start hour (inclusive, local time).
    #[serde(default = "default_on_peak_start_hour")]
    pub on_peak_start_hour: u32,

    /// On-peak window end hour (exclusive, local time).
    #[serde(default = "default_on_peak_end_hour")]
    pub on_peak_end_hour: u32,

    /// Whether weekends are exempt from the on-peak rate.
    #[serde(default = "default_true")]
    pub on_peak_weekdays_only: bool,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            import_rate: default_import_rate(),
            on_peak_import_rate: default_on_peak_import_rate(),
            export_rate: default_export_rate(),
            on_peak_months: default_on_peak_months(),
            on_peak_start_hour: default_on_peak_start_hour(),
            on_peak_end_hour: default_on_peak_end_hour(),
            on_peak_weekdays_only: default_true(),
        }
    }
}

fn default_import_rate() -> f32 {
    0.12
}

fn default_on_peak_import_rate() -> f32 {
    0.32
}

fn default_export_rate() -> f32 {
    0.08
}

fn default_on_peak_months() -> Vec<u32> {
    vec![5, 6, 7, 8, 9, 10]
}

fn default_on_peak_start_hour() -> u32 {
    16
}

fn default_on_peak_end_hour() -> u32 {
    21
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargerDriverConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarChargerConfig {
    /// Power-record channel measuring the charger.
    #[serde(default = "default_ev_key")]
    pub power_sensor_key: String,

    /// Period of the fast charge-rate adjustment loop, seconds.
    #[serde(default = "default_charge_cycle_length")]
    pub cycle_length_secs: u64,

    /// Charge target; the car is considered full at this state of charge.
    #[serde(default = "default_max_state_of_charge")]
    pub max_state_of_charge: f32,

    /// Base URL of the car telemetry sensor providing the state of charge.
    pub car_state_url: String,

    pub charger: ChargerDriverConfig,
}

fn default_ev_key() -> String {
    "ev".to_owned()
}

fn default_charge_cycle_length() -> u64 {
    15
}

fn default_max_state_of_charge() -> f32 {
    80.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TankDriverConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaterHeaterConfig {
    #[serde(default = "default_water_heater_key")]
    pub power_sensor_key: String,

    /// Heating element draw, kW.
    #[serde(default = "default_water_heater_power")]
    pub power: f32,

    /// Heating pace: minutes of run time per missing degree Fahrenheit.
    #[serde(default = "default_minutes_per_degree")]
    pub minutes_per_degree: f32,

    /// Desired water temperature, Fahrenheit.
    #[serde(default = "default_desired_temperature")]
    pub desired_temperature: f32,

    /// Minimum run once started, seconds.
    #[serde(default = "default_wh_min_run_time")]
    pub min_run_time_secs: u64,

    /// Not-runnable cooldown applied when the tank stops drawing power.
    #[serde(default = "default_no_power_delay")]
    pub no_power_delay_secs: u64,

    pub tank: TankDriverConfig,
}

fn default_water_heater_key() -> String {
    "water heater".to_owned()
}

fn default_water_heater_power() -> f32 {
    4.65
}

fn default_minutes_per_degree() -> f32 {
    2.0
}

fn default_desired_temperature() -> f32 {
    125.0
}

fn default_wh_min_run_time() -> u64 {
    60 * 10
}

fn default_no_power_delay() -> u64 {
    60 * 30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThermostatDriverConfig {
    pub base_url: String,
    pub api_key: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HvacConfig {
    /// Channels measuring the HVAC system (condenser and air handler).
    #[serde(default = "default_hvac_keys")]
    pub power_sensor_keys: Vec<String>,

    /// Compressor protection: minimum run once started, seconds.
    #[serde(default = "default_hvac_min_run_time")]
    pub min_run_time_secs: u64,

    /// Minimum pause between two runs, seconds.
    #[serde(default = "default_hvac_min_pause")]
    pub min_pause_secs: u64,

    /// Hold offset applied beyond the optimal temperature, Fahrenheit.
    #[serde(default = "default_temperature_offset")]
    pub temperature_offset: f32,

    /// Time of day the home should be at the goal temperature, "HH:MM".
    #[serde(default = "default_goal_time")]
    pub goal_time: String,

    #[serde(default = "default_goal_temperature")]
    pub goal_temperature: f32,

    /// Comfort band `[low, high]`, Fahrenheit.
    #[serde(default = "default_comfort_range")]
    pub comfort_range: [f32; 2],

    /// Name of the remote sensor used as the home temperature.
    #[serde(default = "default_temperature_sensor")]
    pub temperature_sensor: String,

    pub thermostat: ThermostatDriverConfig,
}

fn default_hvac_keys() -> Vec<String> {
    vec!["a/c".to_owned(), "air handler".to_owned()]
}

fn default_hvac_min_run_time() -> u64 {
    60 * 7
}

fn default_hvac_min_pause() -> u64 {
    60 * 5
}

fn default_temperature_offset() -> f32 {
    2.0
}

fn default_goal_time() -> String {
    "22:30".to_owned()
}

fn default_goal_temperature() -> f32 {
    73.0
}

fn default_comfort_range() -> [f32; 2] {
    [71.0, 78.0]
}

fn default_temperature_sensor() -> String {
    "Home".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchDriverConfig {
    pub base_url: String,
    pub login: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolPumpConfig {
    #[serde(default = "default_pool_key")]
    pub power_sensor_key: String,

    /// Pump protection: minimum run once started, seconds.
    #[serde(default = "default_pool_min_run_time")]
    pub min_run_time_secs: u64,

    pub switch: SwitchDriverConfig,
}

fn default_pool_key() -> String {
    "pool".to_owned()
}

fn default_pool_min_run_time() -> u64 {
    60 * 7
}
