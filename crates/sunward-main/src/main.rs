// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

mod api;
mod config;
mod monitor;

use anyhow::{Context, Result};
use clap::Parser;
use monitor::StoreMonitor;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use sunward_adapters::{
    AdapterError, CarStateClient, EnergyMonitorClient, ProductionSimulatorClient,
    PulseChargerClient, SwitchClient, TankClient, TariffSchedule, ThermostatClient, WeatherClient,
};
use sunward_core::{
    MonitorSink, Scheduler, SchedulerClient, SchedulerControl, SchedulerSettings, SensorReader,
    Store, TaskRegistry, Watchdog, run_scheduler_service,
};
use sunward_tasks::{
    CachedThermostat, CarChargerTask, Charger, CloudPoolSwitch, HvacPlanner, HvacTask,
    PoolPumpTask, PulseCharger, TaskServiceContext, WaterHeaterTask, run_car_charger_service,
    run_hvac_service, run_pool_pump_service, run_water_heater_service,
};
use sunward_types::SunwardConfig;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Exit code for missing credentials and unusable configuration, so
/// supervision can tell "fix the data" apart from a crash.
const EX_DATAERR: u8 = 65;

#[derive(Debug, Parser)]
#[command(name = "sunward", about = "PV-aware home load scheduler", version)]
struct Cli {
    /// Path of the configuration file.
    #[arg(short, long, default_value = "/etc/sunward/sunward.toml")]
    config: PathBuf,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let data_error = err.is::<config::ConfigError>()
        || err.downcast_ref::<AdapterError>().is_some_and(|err| {
            matches!(
                err,
                AdapterError::Config(_) | AdapterError::AuthenticationFailed
            )
        });
    if data_error { EX_DATAERR } else { 1 }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open the log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let config = config::load(&cli.config)?;

    info!("Starting Sunward - scheduling home loads on PV production");
    info!("Configuration summary:");
    info!(
        "   Scheduler: window {} records, noise threshold {} kW, record gap {} min",
        config.scheduler.window_size,
        config.scheduler.ignore_power_threshold,
        config.scheduler.max_record_gap_minutes
    );
    info!("   Energy monitor: {}", config.energy_monitor.base_url);
    info!(
        "   Production simulator: {}",
        config.production_simulator.base_url
    );
    for (name, enabled) in [
        ("car charger", config.car_charger.is_some()),
        ("water heater", config.water_heater.is_some()),
        ("HVAC", config.hvac.is_some()),
        ("pool pump", config.pool_pump.is_some()),
    ] {
        info!(
            "   Task {name}: {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create the tokio runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: SunwardConfig) -> Result<()> {
    let store = Arc::new(Store::open(&config.system.store_path)?);
    let registry = Arc::new(TaskRegistry::new());
    let monitor: Arc<dyn MonitorSink> = Arc::new(StoreMonitor::new(store.clone()));
    let watchdog = Watchdog::spawn(monitor.clone());

    let energy_monitor = Arc::new(EnergyMonitorClient::new(
        &config.energy_monitor.base_url,
        config.energy_monitor.token.clone(),
    )?);
    let simulator = Arc::new(ProductionSimulatorClient::new(
        &config.production_simulator.base_url,
    )?);
    let weather = Arc::new(WeatherClient::new(&config.weather.base_url)?);
    let tariff = Arc::new(TariffSchedule::new(config.tariff.clone()));

    let scheduler = Arc::new(Mutex::new(Scheduler::new(
        registry.clone(),
        SchedulerSettings::from(&config.scheduler),
    )));
    let scheduler_control: Arc<dyn SchedulerControl> =
        Arc::new(SchedulerClient::new(scheduler.clone()));
    let context = TaskServiceContext {
        registry: registry.clone(),
        scheduler: scheduler_control,
        watchdog: watchdog.clone(),
        monitor: monitor.clone(),
    };

    if let Some(charger_config) = config.car_charger.clone() {
        let client = PulseChargerClient::new(
            &charger_config.charger.base_url,
            &charger_config.charger.username,
            &charger_config.charger.password,
            &charger_config.charger.device_id,
        )?;
        let car = CarStateClient::new(&charger_config.car_state_url, store.clone())?;
        let charger: Arc<dyn Charger> = Arc::new(PulseCharger::new(
            "EV",
            client,
            car,
            charger_config.max_state_of_charge,
        ));
        let task = Arc::new(CarChargerTask::new(charger, &charger_config));
        info!("Car charger service enabled");
        tokio::spawn(run_car_charger_service(
            task,
            context.clone(),
            SensorReader::new("power", energy_monitor.clone()),
            SensorReader::new("power_simulator", simulator.clone()),
            Duration::from_secs(charger_config.cycle_length_secs),
        ));
    }

    if let Some(heater_config) = config.water_heater.clone() {
        let tank = Arc::new(TankClient::new(
            &heater_config.tank.base_url,
            &heater_config.tank.email,
            &heater_config.tank.password,
            &heater_config.tank.device_id,
        )?);
        let task = Arc::new(WaterHeaterTask::new(tank, heater_config));
        info!("Water heater service enabled");
        tokio::spawn(run_water_heater_service(
            task,
            context.clone(),
            simulator.clone(),
        ));
    }

    if let Some(hvac_config) = config.hvac.clone() {
        let thermostat = ThermostatClient::new(
            &hvac_config.thermostat.base_url,
            &hvac_config.thermostat.api_key,
            &hvac_config.thermostat.device_id,
            store.clone(),
        )?;
        let planner = HvacPlanner::new(weather.clone(), simulator.clone(), &hvac_config);
        let planner_handle = planner.handle();
        tokio::spawn(planner.run());
        let task = Arc::new(HvacTask::new(
            Arc::new(CachedThermostat::new(thermostat)),
            planner_handle,
            hvac_config,
        ));
        info!("HVAC service enabled");
        tokio::spawn(run_hvac_service(task, context.clone()));
    }

    if let Some(pool_config) = config.pool_pump.clone() {
        let switch = SwitchClient::new(
            &pool_config.switch.base_url,
            &pool_config.switch.login,
            &pool_config.switch.password,
        )?;
        let pool_switch = Arc::new(CloudPoolSwitch::new(
            switch,
            pool_config.switch.device_id.clone(),
        ));
        let task = Arc::new(PoolPumpTask::new(pool_switch, store.clone(), pool_config));
        info!("Pool pump service enabled");
        tokio::spawn(run_pool_pump_service(
            task,
            context.clone(),
            simulator.clone(),
            weather.clone(),
        ));
    }

    tokio::spawn(run_scheduler_service(
        scheduler.clone(),
        SensorReader::new("power", energy_monitor.clone()),
        SensorReader::new("power_simulator", simulator.clone()),
        watchdog.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.system.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.system.listen_addr))?;
    info!("Operator API listening on {}", config.system.listen_addr);
    let state = api::ApiState {
        scheduler,
        registry,
        tariff,
    };
    axum::serve(listener, api::router(state))
        .await
        .context("Operator API server failed")?;
    Ok(())
}
