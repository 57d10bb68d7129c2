// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::errors::{AdapterError, AdapterResult};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sunward_core::Store;
use tracing::warn;

const STORE_SERVICE: &str = "car_state";
const STORE_KEY: &str = "last_known";

/// Car telemetry snapshot, as served by the car data sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarState {
    pub state_of_charge: f32,
    #[serde(default)]
    pub range_miles: Option<f32>,
}

/// Client of the car telemetry sensor with a persisted fallback.
///
/// Vehicle telemetry is slow and flaky (the car sleeps); the last good
/// snapshot is persisted and served when a fresh read fails, so the
/// charger task can still rank its priority.
pub struct CarStateClient {
    base_url: String,
    client: Client,
    store: Arc<Store>,
}

impl std::fmt::Debug for CarStateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarStateClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl CarStateClient {
    pub fn new(base_url: impl Into<String>, store: Arc<Store>) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| AdapterError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            store,
        })
    }

    async fn fetch(&self) -> AdapterResult<CarState> {
        let url = format!("{}/api/state", self.base_url);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json::<CarState>().await?),
            status => Err(AdapterError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Current car state; falls back to the last persisted snapshot.
    pub async fn state(&self) -> AdapterResult<CarState> {
        match self.fetch().await {
            Ok(state) => {
                if let Err(err) = self.store.put(STORE_SERVICE, STORE_KEY, &state) {
                    warn!("Failed to persist the car state: {err:#}");
                }
                Ok(state)
            }
            Err(err) => {
                warn!("Car telemetry read failed, using the last known state: {err}");
                match self.store.get::<CarState>(STORE_SERVICE, STORE_KEY) {
                    Ok(Some(state)) => Ok(state),
                    _ => Err(err),
                }
            }
        }
    }

    pub async fn state_of_charge(&self) -> AdapterResult<f32> {
        Ok(self.state().await?.state_of_charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = Arc::new(Store::open(path.to_str().unwrap()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_fresh_read_is_persisted() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/state")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"state_of_charge": 63.5, "range_miles": 172.0}).to_string())
            .create_async()
            .await;

        let (_dir, store) = temp_store();
        let client = CarStateClient::new(server.url(), store.clone()).unwrap();
        assert_eq!(client.state_of_charge().await.unwrap(), 63.5);
        let persisted: Option<CarState> = store.get(STORE_SERVICE, STORE_KEY).unwrap();
        assert_eq!(persisted.map(|state| state.state_of_charge), Some(63.5));
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_last_known() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/state")
            .with_status(503)
            .create_async()
            .await;

        let (_dir, store) = temp_store();
        store
            .put(
                STORE_SERVICE,
                STORE_KEY,
                &CarState {
                    state_of_charge: 41.0,
                    range_miles: None,
                },
            )
            .unwrap();
        let client = CarStateClient::new(server.url(), store).unwrap();
        assert_eq!(client.state_of_charge().await.unwrap(), 41.0);
    }

    #[tokio::test]
    async fn test_failure_without_history_is_an_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/state")
            .with_status(503)
            .create_async()
            .await;

        let (_dir, store) = temp_store();
        let client = CarStateClient::new(server.url(), store).unwrap();
        assert!(client.state().await.is_err());
    }
}
