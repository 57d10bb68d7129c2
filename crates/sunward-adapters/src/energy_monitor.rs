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
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use sunward_core::Sensor;
use sunward_types::{PowerRecord, RecordScale};
use tracing::{debug, error, warn};

/// Client of the whole-home energy monitor proxy.
///
/// The monitor samples the service entrance and the per-circuit CTs and
/// serves records at second, minute and day resolution. An empty record
/// means no fresh sample at that resolution yet.
pub struct EnergyMonitorClient {
    base_url: String,
    token: Option<String>,
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for EnergyMonitorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnergyMonitorClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl EnergyMonitorClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| AdapterError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            token,
            client,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        })
    }

    /// Fetch a record at the requested resolution.
    pub async fn record(&self, scale: RecordScale) -> AdapterResult<PowerRecord> {
        let url = format!(
            "{}/api/power?scale={}",
            self.base_url,
            scale.as_query_value()
        );
        let response = self
            .retry_request(|| async {
                let mut request = self.client.get(&url);
                if let Some(token) = &self.token {
                    request = request.bearer_auth(token);
                }
                request.send().await
            })
            .await?;

        match response.status() {
            StatusCode::OK => {
                let record = response.json::<PowerRecord>().await?;
                debug!("Power record ({scale}): {} channels", record.len());
                Ok(record)
            }
            StatusCode::NO_CONTENT => Ok(PowerRecord::new()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                error!("Energy monitor rejected our credentials");
                Err(AdapterError::AuthenticationFailed)
            }
            status => Err(AdapterError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn retry_request<F, Fut>(&self, mut request_fn: F) -> AdapterResult<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempts = 0;
        let mut delay = self.retry_delay;
        loop {
            attempts += 1;
            match request_fn().await {
                Ok(response) => return Ok(response),
                Err(err) if attempts >= self.max_retries => {
                    error!("Request failed after {attempts} attempts: {err}");
                    return Err(AdapterError::Http(err));
                }
                Err(err) => {
                    warn!(
                        "Request failed (attempt {attempts}/{}): {err}. Retrying in {delay:?}",
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl Sensor for EnergyMonitorClient {
    async fn read(&self, scale: RecordScale) -> Result<PowerRecord> {
        Ok(self.record(scale).await?)
    }

    async fn units(&self, scale: RecordScale) -> Result<BTreeMap<String, String>> {
        let record = self.record(scale).await?;
        Ok(record
            .channel_names()
            .map(|name| (name.to_owned(), scale.unit().to_owned()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/power?scale=minute")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"net": -2.4, "solar": -5.0, "ev": 1.4, "pool": 1.2}).to_string(),
            )
            .create_async()
            .await;

        let client =
            EnergyMonitorClient::new(server.url(), Some("secret".to_owned())).unwrap();
        let record = client.record(RecordScale::Minute).await.unwrap();
        assert_eq!(record.net(), -2.4);
        assert_eq!(record.get("ev"), Some(1.4));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_content_means_no_fresh_record() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/power?scale=second")
            .with_status(204)
            .create_async()
            .await;

        let client = EnergyMonitorClient::new(server.url(), None).unwrap();
        let record = client.record(RecordScale::Second).await.unwrap();
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_maps_to_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/power?scale=minute")
            .with_status(401)
            .create_async()
            .await;

        let client = EnergyMonitorClient::new(server.url(), None).unwrap();
        let result = client.record(RecordScale::Minute).await;
        assert!(matches!(result, Err(AdapterError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_units_follow_scale() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/power?scale=day")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"net": 12.5, "solar": -30.1}).to_string())
            .create_async()
            .await;

        let client = EnergyMonitorClient::new(server.url(), None).unwrap();
        let units = client.units(RecordScale::Day).await.unwrap();
        assert_eq!(units.get("net").map(String::as_str), Some("kWh"));
    }
}
