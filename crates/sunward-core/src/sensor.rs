// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use sunward_types::{PowerRecord, RecordScale};
use tracing::warn;

/// Interface a power sensor implements.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Return a record at the requested resolution. An empty record means
    /// the sensor is healthy but has no fresh data.
    async fn read(&self, scale: RecordScale) -> Result<PowerRecord>;

    /// Unit of each channel at the requested resolution.
    async fn units(&self, scale: RecordScale) -> Result<BTreeMap<String, String>>;
}

/// Sensor wrapper with error management.
///
/// It discharges the caller from handling transport errors: a failed or
/// empty `read()` yields `None`, and `elapsed_since_latest_record()` tells
/// how long ago a record last came through, which drives the scheduler's
/// degraded-mode transition.
pub struct SensorReader {
    name: String,
    sensor: Arc<dyn Sensor>,
    latest_read: Mutex<Option<DateTime<Local>>>,
}

impl std::fmt::Debug for SensorReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorReader")
            .field("name", &self.name)
            .finish()
    }
}

impl SensorReader {
    pub fn new(name: impl Into<String>, sensor: Arc<dyn Sensor>) -> Self {
        Self {
            name: name.into(),
            sensor,
            latest_read: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a record, `None` on failure or when no fresh data exists.
    pub async fn read(&self, scale: RecordScale) -> Option<PowerRecord> {
        match self.sensor.read(scale).await {
            Ok(record) if !record.is_empty() => {
                *self.latest_read.lock() = Some(Local::now());
                Some(record)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("Failed to read a new {} sensor record: {err:#}", self.name);
                None
            }
        }
    }

    pub async fn units(&self, scale: RecordScale) -> Option<BTreeMap<String, String>> {
        match self.sensor.units(scale).await {
            Ok(units) => Some(units),
            Err(err) => {
                warn!("Failed to read the {} sensor units: {err:#}", self.name);
                None
            }
        }
    }

    /// Time elapsed since `read()` last retrieved a record.
    ///
    /// Before the first successful read, it reports one minute, so a
    /// freshly started service does not immediately trip the record-gap
    /// threshold.
    pub fn elapsed_since_latest_record(&self) -> Duration {
        let mut latest = self.latest_read.lock();
        let reference =
            *latest.get_or_insert_with(|| Local::now() - Duration::minutes(1));
        Local::now() - reference
    }

    #[cfg(test)]
    pub(crate) fn set_latest_read(&self, at: DateTime<Local>) {
        *self.latest_read.lock() = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakySensor {
        fail: bool,
        empty: bool,
    }

    #[async_trait]
    impl Sensor for FlakySensor {
        async fn read(&self, _scale: RecordScale) -> Result<PowerRecord> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            if self.empty {
                return Ok(PowerRecord::new());
            }
            Ok(PowerRecord::from([("net", -1.0)]))
        }

        async fn units(&self, scale: RecordScale) -> Result<BTreeMap<String, String>> {
            Ok([("net".to_owned(), scale.unit().to_owned())]
                .into_iter()
                .collect())
        }
    }

    #[tokio::test]
    async fn test_read_swallows_errors() {
        let reader = SensorReader::new(
            "power",
            Arc::new(FlakySensor {
                fail: true,
                empty: false,
            }),
        );
        assert!(reader.read(RecordScale::Minute).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_record_does_not_refresh_age() {
        let reader = SensorReader::new(
            "power",
            Arc::new(FlakySensor {
                fail: false,
                empty: true,
            }),
        );
        reader.set_latest_read(Local::now() - Duration::minutes(10));
        assert!(reader.read(RecordScale::Minute).await.is_none());
        assert!(reader.elapsed_since_latest_record() >= Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_successful_read_refreshes_age() {
        let reader = SensorReader::new(
            "power",
            Arc::new(FlakySensor {
                fail: false,
                empty: false,
            }),
        );
        reader.set_latest_read(Local::now() - Duration::minutes(10));
        assert!(reader.read(RecordScale::Minute).await.is_some());
        assert!(reader.elapsed_since_latest_record() < Duration::minutes(1));
    }
}
