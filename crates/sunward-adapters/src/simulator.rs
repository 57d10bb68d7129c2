// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::errors::{AdapterError, AdapterResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use sunward_core::{ProductionOracle, Sensor};
use sunward_types::{PowerRecord, RecordScale};
use tracing::debug;

/// Client of the clear-sky PV production simulator.
///
/// The simulator knows the plant location and geometry and serves the
/// expected clear-sky production curve. It doubles as a power sensor of
/// last resort: when the real monitor is down, its simulated records keep
/// the scheduler going.
pub struct ProductionSimulatorClient {
    base_url: String,
    client: Client,
}

impl std::fmt::Debug for ProductionSimulatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionSimulatorClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct PowerResponse {
    power: f32,
}

#[derive(Debug, Deserialize)]
struct WindowResponse {
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct DaytimeResponse {
    sunrise: String,
    sunset: String,
}

fn parse_time(value: &str) -> AdapterResult<DateTime<Local>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Local))
        .map_err(|err| AdapterError::Payload(format!("bad timestamp '{value}': {err}")))
}

impl ProductionSimulatorClient {
    pub fn new(base_url: impl Into<String>) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| AdapterError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path_and_query: &str) -> AdapterResult<T> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json::<T>().await?),
            status => Err(AdapterError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl ProductionOracle for ProductionSimulatorClient {
    async fn power_at(&self, at: DateTime<Local>) -> Result<f32> {
        let response: PowerResponse = self
            .get(&format!(
                "/api/power-at?at={}",
                urlencode(&at.to_rfc3339())
            ))
            .await?;
        Ok(response.power)
    }

    async fn max_available_power_at(&self, at: DateTime<Local>) -> Result<f32> {
        let response: PowerResponse = self
            .get(&format!(
                "/api/max-available-power?at={}",
                urlencode(&at.to_rfc3339())
            ))
            .await?;
        Ok(response.power)
    }

    async fn next_power_window(
        &self,
        min_power: f32,
    ) -> Result<(DateTime<Local>, DateTime<Local>)> {
        let response: WindowResponse = self
            .get(&format!("/api/power-window?min_power={min_power}"))
            .await?;
        let window = (parse_time(&response.start)?, parse_time(&response.end)?);
        debug!(
            "Next window with {min_power:.2} kW: {} -> {}",
            window.0, window.1
        );
        Ok(window)
    }

    async fn daytime_at(&self, at: DateTime<Local>) -> Result<(DateTime<Local>, DateTime<Local>)> {
        let response: DaytimeResponse = self
            .get(&format!(
                "/api/daytime?at={}",
                urlencode(&at.to_rfc3339())
            ))
            .await?;
        Ok((parse_time(&response.sunrise)?, parse_time(&response.sunset)?))
    }
}

#[async_trait]
impl Sensor for ProductionSimulatorClient {
    async fn read(&self, scale: RecordScale) -> Result<PowerRecord> {
        let record: PowerRecord = self
            .get(&format!(
                "/api/record?scale={}",
                scale.as_query_value()
            ))
            .await?;
        Ok(record)
    }

    async fn units(&self, scale: RecordScale) -> Result<BTreeMap<String, String>> {
        let record = self.read(scale).await?;
        Ok(record
            .channel_names()
            .map(|name| (name.to_owned(), scale.unit().to_owned()))
            .collect())
    }
}

/// Percent-encode the reserved characters appearing in RFC 3339 stamps.
fn urlencode(value: &str) -> String {
    value.replace('+', "%2B").replace(':', "%3A")
}
