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
use std::time::Duration;
use sunward_core::{WeatherConditions, WeatherOracle};

/// Client of the local weather service (station readings plus forecast).
pub struct WeatherClient {
    base_url: String,
    client: Client,
}

impl std::fmt::Debug for WeatherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TemperatureResponse {
    temperature: f32,
}

impl WeatherClient {
    pub fn new(base_url: impl Into<String>) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(3))
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
impl WeatherOracle for WeatherClient {
    async fn read(&self) -> Result<WeatherConditions> {
        Ok(self.get::<WeatherConditions>("/api/conditions").await?)
    }

    async fn temperature_at(&self, at: DateTime<Local>) -> Result<f32> {
        let response: TemperatureResponse = self
            .get(&format!(
                "/api/temperature?at={}",
                at.to_rfc3339().replace('+', "%2B").replace(':', "%3A")
            ))
            .await?;
        Ok(response.temperature)
    }

    async fn minimum_temperature(&self, hours: u32) -> Result<f32> {
        let response: TemperatureResponse = self
            .get(&format!("/api/minimum-temperature?hours={hours}"))
            .await?;
        Ok(response.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[tokio::test]
    async fn test_read_conditions() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/conditions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"temperature": 92.5, "wind_speed": 3.1, "humidity": 18.0}).to_string(),
            )
            .create_async()
            .await;

        let client = WeatherClient::new(server.url()).unwrap();
        let conditions = client.read().await.unwrap();
        assert_eq!(conditions.temperature, 92.5);
    }

    #[tokio::test]
    async fn test_forecast_temperature() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/temperature")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"temperature": 65.0}).to_string())
            .create_async()
            .await;

        let client = WeatherClient::new(server.url()).unwrap();
        let temperature = client.temperature_at(Local::now()).await.unwrap();
        assert_eq!(temperature, 65.0);
    }
}
