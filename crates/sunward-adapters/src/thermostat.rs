// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::errors::{AdapterError, AdapterResult};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sunward_core::Store;
use tracing::{debug, warn};

const STORE_SERVICE: &str = "thermostat";
const STORE_KEY: &str = "tokens";

/// OAuth token pair persisted between restarts.
///
/// Missing tokens are a startup data error: the operator must run the
/// enrollment flow once before the HVAC service can come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermostatTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// An active event on the thermostat, such as a hold.
#[derive(Debug, Clone, Deserialize)]
pub struct ThermostatEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub running: bool,
}

/// A remote temperature sensor paired with the thermostat.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSensorReading {
    pub name: String,
    /// Fahrenheit; `None` when the sensor is unreachable.
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ThermostatSnapshot {
    #[serde(default)]
    equipment_status: Option<String>,
    #[serde(default)]
    hvac_mode: Option<String>,
    #[serde(default)]
    events: Vec<ThermostatEvent>,
    #[serde(default)]
    remote_sensors: Vec<RemoteSensorReading>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

const CALL_ATTEMPTS: u32 = 2;

/// Cloud client of the thermostat.
///
/// Access tokens expire aggressively; any auth rejection refreshes the
/// pair, persists it, and replays the failing call once.
pub struct ThermostatClient {
    base_url: String,
    api_key: String,
    device_id: String,
    client: Client,
    store: Arc<Store>,
}

impl std::fmt::Debug for ThermostatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThermostatClient")
            .field("base_url", &self.base_url)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl ThermostatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        device_id: impl Into<String>,
        store: Arc<Store>,
    ) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AdapterError::Config(format!("Failed to build HTTP client: {err}")))?;
        let this = Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            device_id: device_id.into(),
            client,
            store,
        };
        // Enrollment must have happened: no tokens means a data error the
        // process exits on at startup.
        this.tokens()?;
        Ok(this)
    }

    fn tokens(&self) -> AdapterResult<ThermostatTokens> {
        self.store
            .get::<ThermostatTokens>(STORE_SERVICE, STORE_KEY)
            .map_err(|err| AdapterError::Config(err.to_string()))?
            .ok_or_else(|| {
                AdapterError::Config(
                    "thermostat tokens are not enrolled in the store".to_owned(),
                )
            })
    }

    async fn refresh_tokens(&self) -> AdapterResult<()> {
        let tokens = self.tokens()?;
        let url = format!("{}/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
                ("client_id", self.api_key.as_str()),
            ])
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(AdapterError::AuthenticationFailed);
        }
        let refreshed = response.json::<RefreshResponse>().await?;
        let tokens = ThermostatTokens {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
        };
        self.store
            .put(STORE_SERVICE, STORE_KEY, &tokens)
            .map_err(|err| AdapterError::Config(err.to_string()))?;
        debug!("Thermostat tokens refreshed");
        Ok(())
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AdapterResult<reqwest::Response> {
        for attempt in 0..CALL_ATTEMPTS {
            let tokens = self.tokens()?;
            let url = format!("{}{}", self.base_url, path);
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&tokens.access_token);
            if let Some(body) = &body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response)
                    if response.status() == StatusCode::UNAUTHORIZED
                        || response.status() == StatusCode::FORBIDDEN =>
                {
                    warn!("Thermostat call rejected, refreshing tokens");
                    self.refresh_tokens().await?;
                }
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    return Err(AdapterError::Api {
                        status: response.status().as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    });
                }
                Err(err) => {
                    warn!(
                        "Thermostat call failed (attempt {}/{CALL_ATTEMPTS}): {err}",
                        attempt + 1
                    );
                    if attempt + 1 >= CALL_ATTEMPTS {
                        return Err(AdapterError::Http(err));
                    }
                }
            }
        }
        Err(AdapterError::AuthenticationFailed)
    }

    async fn snapshot(&self, include: &str) -> AdapterResult<ThermostatSnapshot> {
        let response = self
            .call(
                Method::GET,
                &format!("/thermostats/{}?include={include}", self.device_id),
                None,
            )
            .await?;
        Ok(response.json::<ThermostatSnapshot>().await?)
    }

    /// Equipment currently running, e.g. "compCool1,fan". Empty when idle.
    pub async fn equipment_status(&self) -> AdapterResult<String> {
        Ok(self
            .snapshot("equipment_status")
            .await?
            .equipment_status
            .unwrap_or_default())
    }

    /// Configured mode: "heat", "cool", "auto" or "off".
    pub async fn hvac_mode(&self) -> AdapterResult<String> {
        self.snapshot("settings")
            .await?
            .hvac_mode
            .ok_or_else(|| AdapterError::Payload("settings without hvac_mode".to_owned()))
    }

    pub async fn events(&self) -> AdapterResult<Vec<ThermostatEvent>> {
        Ok(self.snapshot("events").await?.events)
    }

    pub async fn remote_sensors(&self) -> AdapterResult<Vec<RemoteSensorReading>> {
        Ok(self.snapshot("sensors").await?.remote_sensors)
    }

    /// Place a temperature hold for a whole number of hours.
    pub async fn set_hold(
        &self,
        hold_hours: u32,
        heat_hold_temp: f32,
        cool_hold_temp: f32,
    ) -> AdapterResult<()> {
        self.call(
            Method::POST,
            &format!("/thermostats/{}/hold", self.device_id),
            Some(json!({
                "hold_type": "holdHours",
                "hold_hours": hold_hours,
                "heat_hold_temp": heat_hold_temp,
                "cool_hold_temp": cool_hold_temp,
            })),
        )
        .await?;
        Ok(())
    }

    /// Cancel the active hold and resume the program.
    pub async fn resume_program(&self) -> AdapterResult<()> {
        self.call(
            Method::POST,
            &format!("/thermostats/{}/resume", self.device_id),
            Some(json!({"resume_all": false})),
        )
        .await?;
        Ok(())
    }
}
