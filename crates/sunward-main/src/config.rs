// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use anyhow::Result;
use std::path::Path;
use sunward_types::SunwardConfig;
use thiserror::Error;

/// Configuration problems are data errors: the process exits with the
/// data-error code so supervision does not restart it into the same wall.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

pub fn load(path: &Path) -> Result<SunwardConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| ConfigError(format!("cannot read {}: {err}", path.display())))?;
    let config: SunwardConfig = toml::from_str(&text)
        .map_err(|err| ConfigError(format!("cannot parse {}: {err}", path.display())))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[system]
listen_addr = "127.0.0.1:9000"
"#
        )
        .unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.system.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.scheduler.window_size, 12);
        assert!(config.car_charger.is_none());
    }

    #[test]
    fn test_task_sections_are_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[pool_pump]
power_sensor_key = "pool"

[pool_pump.switch]
base_url = "https://cloud.example.com"
login = "home"
password = "secret"
device_id = "pool-1"

[water_heater]
power = 4.4

[water_heater.tank]
base_url = "https://tank.example.com"
email = "home@example.com"
password = "secret"
device_id = "77"
"#
        )
        .unwrap();
        let config = load(file.path()).unwrap();
        let pool = config.pool_pump.unwrap();
        assert_eq!(pool.switch.device_id, "pool-1");
        assert_eq!(pool.min_run_time_secs, 60 * 7);
        let heater = config.water_heater.unwrap();
        assert_eq!(heater.power, 4.4);
        assert_eq!(heater.desired_temperature, 125.0);
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = load(Path::new("/nonexistent/sunward.toml")).unwrap_err();
        assert!(err.is::<ConfigError>());
    }

    #[test]
    fn test_malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler\nwindow_size = twelve").unwrap();
        let err = load(file.path()).unwrap_err();
        assert!(err.is::<ConfigError>());
    }
}
