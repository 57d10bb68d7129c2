// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::errors::{AdapterError, AdapterResult};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Charger cloud states, as reported by the status endpoint.
pub mod status_id {
    pub const UNPLUGGED: u16 = 161;
    pub const WAITING_FOR_NEXT_SCHEDULE: u16 = 179;
    pub const FULLY_CHARGED: u16 = 181;
    pub const PAUSED: u16 = 182;
    pub const CHARGING: u16 = 194;
}

/// Decoded charger status.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargerState {
    pub status_id: u16,
    pub config_data: ChargerConfigData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargerConfigData {
    /// Current the charger is configured to deliver, ampere.
    pub max_charging_current: u32,
    /// Hardware ceiling of the installation, ampere.
    pub max_available_current: u32,
}

impl ChargerState {
    pub fn is_charging(&self) -> bool {
        self.status_id == status_id::CHARGING
    }

    pub fn is_plugged_in(&self) -> bool {
        !matches!(
            self.status_id,
            status_id::UNPLUGGED | status_id::FULLY_CHARGED
        )
    }
}

/// Cloud client for a Pulse-style EVSE.
///
/// Bearer token auth; an expired token is transparently renewed and the
/// failing call replayed. Transient transport errors are retried with a
/// short pause, and a call that keeps failing surfaces as an error the
/// task turns into "temporarily unreachable".
pub struct PulseChargerClient {
    base_url: String,
    username: String,
    password: String,
    device_id: String,
    client: Client,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for PulseChargerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseChargerClient")
            .field("base_url", &self.base_url)
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    jwt: String,
}

const CALL_ATTEMPTS: u32 = 3;

impl PulseChargerClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        device_id: impl Into<String>,
    ) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| AdapterError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            device_id: device_id.into(),
            client,
            token: Mutex::new(None),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn authenticate(&self) -> AdapterResult<()> {
        let url = format!("{}/auth/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(AdapterError::AuthenticationFailed);
        }
        let token = response.json::<TokenResponse>().await?;
        *self.token.lock() = Some(token.jwt);
        debug!("Charger cloud authentication renewed");
        Ok(())
    }

    async fn token(&self) -> AdapterResult<String> {
        if let Some(token) = self.token.lock().clone() {
            return Ok(token);
        }
        self.authenticate().await?;
        self.token
            .lock()
            .clone()
            .ok_or(AdapterError::AuthenticationFailed)
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AdapterResult<reqwest::Response> {
        for attempt in 0..CALL_ATTEMPTS {
            let token = self.token().await?;
            let url = format!("{}{}", self.base_url, path);
            let mut request = self.client.request(method.clone(), &url).bearer_auth(token);
            if let Some(body) = &body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    warn!("Charger call rejected, renewing authentication");
                    *self.token.lock() = None;
                }
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    return Err(AdapterError::DeviceNotFound(self.device_id.clone()));
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
                        "Charger call failed (attempt {}/{CALL_ATTEMPTS}): {err}",
                        attempt + 1
                    );
                    if attempt + 1 >= CALL_ATTEMPTS {
                        return Err(AdapterError::Http(err));
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        Err(AdapterError::AuthenticationFailed)
    }

    pub async fn state(&self) -> AdapterResult<ChargerState> {
        let response = self
            .call(
                reqwest::Method::GET,
                &format!("/chargers/status/{}", self.device_id),
                None,
            )
            .await?;
        Ok(response.json::<ChargerState>().await?)
    }

    pub async fn resume_charging_session(&self) -> AdapterResult<()> {
        self.call(
            reqwest::Method::POST,
            &format!("/chargers/{}/remote-action", self.device_id),
            Some(json!({"action": "resume"})),
        )
        .await?;
        Ok(())
    }

    pub async fn pause_charging_session(&self) -> AdapterResult<()> {
        self.call(
            reqwest::Method::POST,
            &format!("/chargers/{}/remote-action", self.device_id),
            Some(json!({"action": "pause"})),
        )
        .await?;
        Ok(())
    }

    pub async fn set_max_charging_current(&self, current: u32) -> AdapterResult<()> {
        self.call(
            reqwest::Method::PUT,
            &format!("/chargers/config/{}", self.device_id),
            Some(json!({"maxChargingCurrent": current})),
        )
        .await?;
        Ok(())
    }
}
