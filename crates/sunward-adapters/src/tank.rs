// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::errors::{AdapterError, AdapterResult};
use chrono::{DateTime, NaiveTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Active mode of the tank controller.
///
/// The device is expected to stay configured in timer mode: if this
/// service stops running or the cloud goes away, the tank falls back on
/// its own schedule. Boost forces heating, away forces it off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TankMode {
    Timer,
    Boost,
    Away,
}

impl FromStr for TankMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "timer" => Ok(Self::Timer),
            "boost" => Ok(Self::Boost),
            "away" => Ok(Self::Away),
            _ => Err(anyhow::anyhow!("Unknown tank mode: '{}'", s)),
        }
    }
}

impl TankMode {
    fn endpoint(self) -> &'static str {
        match self {
            Self::Boost => "boost",
            Self::Away => "away",
            Self::Timer => "timer",
        }
    }
}

/// Water sensor outputs of the tank.
#[derive(Debug, Clone, Deserialize)]
pub struct TankWaterState {
    /// Water temperature, Celsius.
    pub temperature: f32,
    /// Available hot water fraction, 0 to 1.
    pub available: f32,
}

/// One scheduled off-period of the device timer for given weekdays.
#[derive(Debug, Clone, Deserialize)]
pub struct TankSchedule {
    /// 0 = Sunday through 6 = Saturday, the device convention.
    pub days_of_week: Vec<u32>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    current_mode: CurrentMode,
}

#[derive(Debug, Deserialize)]
struct CurrentMode {
    #[serde(rename = "type")]
    mode: String,
}

#[derive(Debug, Deserialize)]
struct TimerResponse {
    schedules: Vec<TankSchedule>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

const CALL_ATTEMPTS: u32 = 3;
const ATTEMPT_DELAY: Duration = Duration::from_millis(500);

/// Cloud client of the tank controller.
pub struct TankClient {
    base_url: String,
    email: String,
    password: String,
    device_id: String,
    client: Client,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for TankClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TankClient")
            .field("base_url", &self.base_url)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl TankClient {
    pub fn new(
        base_url: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
        device_id: impl Into<String>,
    ) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| AdapterError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            email: email.into(),
            password: password.into(),
            device_id: device_id.into(),
            client,
            token: Mutex::new(None),
        })
    }

    async fn login(&self) -> AdapterResult<()> {
        let url = format!("{}/auth/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({"email": self.email, "password": self.password}))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(AdapterError::AuthenticationFailed);
        }
        let login = response.json::<LoginResponse>().await?;
        *self.token.lock() = Some(login.token);
        debug!("Tank cloud authentication renewed");
        Ok(())
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AdapterResult<reqwest::Response> {
        for attempt in 0..CALL_ATTEMPTS {
            if self.token.lock().is_none() {
                self.login().await?;
            }
            let token = self.token.lock().clone().unwrap_or_default();
            let url = format!("{}{}", self.base_url, path);
            let mut request = self.client.request(method.clone(), &url).bearer_auth(token);
            if let Some(body) = &body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    warn!("Tank call rejected, renewing authentication");
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
                        "Tank call failed (attempt {}/{CALL_ATTEMPTS}): {err}",
                        attempt + 1
                    );
                    if attempt + 1 >= CALL_ATTEMPTS {
                        return Err(AdapterError::Http(err));
                    }
                    tokio::time::sleep(ATTEMPT_DELAY).await;
                }
            }
        }
        Err(AdapterError::AuthenticationFailed)
    }

    /// Temperature and available hot water.
    pub async fn water(&self) -> AdapterResult<TankWaterState> {
        let response = self
            .call(
                Method::GET,
                &format!("/devices/{}/water", self.device_id),
                None,
            )
            .await?;
        Ok(response.json::<TankWaterState>().await?)
    }

    /// Mode the controller is currently applying.
    pub async fn current_mode(&self) -> AdapterResult<TankMode> {
        let response = self
            .call(
                Method::GET,
                &format!("/devices/{}/info", self.device_id),
                None,
            )
            .await?;
        let info = response.json::<InfoResponse>().await?;
        TankMode::from_str(&info.current_mode.mode)
            .map_err(|err| AdapterError::Payload(err.to_string()))
    }

    /// The device timer's scheduled off-periods.
    pub async fn timer_schedules(&self) -> AdapterResult<Vec<TankSchedule>> {
        let response = self
            .call(
                Method::GET,
                &format!("/devices/{}/timer", self.device_id),
                None,
            )
            .await?;
        let timer = response.json::<TimerResponse>().await?;
        Ok(timer.schedules)
    }

    /// Install a boost or away override from `start` to `end`.
    pub async fn set_mode(
        &self,
        mode: TankMode,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AdapterResult<()> {
        if mode == TankMode::Timer {
            return Err(AdapterError::Config(
                "timer mode is restored by clearing the active override".to_owned(),
            ));
        }
        self.call(
            Method::PUT,
            &format!("/devices/{}/{}", self.device_id, mode.endpoint()),
            Some(json!({"start": start.to_rfc3339(), "end": end.to_rfc3339()})),
        )
        .await?;
        Ok(())
    }

    /// Remove a boost or away override, returning the device to its timer.
    pub async fn clear_mode(&self, mode: TankMode) -> AdapterResult<()> {
        if mode == TankMode::Timer {
            return Ok(());
        }
        self.call(
            Method::DELETE,
            &format!("/devices/{}/{}", self.device_id, mode.endpoint()),
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn login_mock(server: &mut Server) -> mockito::Mock {
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"token": "tank-token"}).to_string())
    }

    #[tokio::test]
    async fn test_water_state() {
        let mut server = Server::new_async().await;
        login_mock(&mut server).create_async().await;
        server
            .mock("GET", "/devices/77/water")
            .match_header("authorization", "Bearer tank-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"temperature": 47.5, "available": 0.8}).to_string())
            .create_async()
            .await;

        let client = TankClient::new(server.url(), "a@b.c", "pw", "77").unwrap();
        let water = client.water().await.unwrap();
        assert_eq!(water.temperature, 47.5);
        assert_eq!(water.available, 0.8);
    }

    #[tokio::test]
    async fn test_current_mode_parses() {
        let mut server = Server::new_async().await;
        login_mock(&mut server).create_async().await;
        server
            .mock("GET", "/devices/77/info")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"current_mode": {"type": "boost"}}).to_string())
            .create_async()
            .await;

        let client = TankClient::new(server.url(), "a@b.c", "pw", "77").unwrap();
        assert_eq!(client.current_mode().await.unwrap(), TankMode::Boost);
    }

    #[tokio::test]
    async fn test_set_boost_sends_window() {
        let mut server = Server::new_async().await;
        login_mock(&mut server).create_async().await;
        let mock = server
            .mock("PUT", "/devices/77/boost")
            .match_body(Matcher::Regex("start".to_owned()))
            .with_status(200)
            .create_async()
            .await;

        let client = TankClient::new(server.url(), "a@b.c", "pw", "77").unwrap();
        let start = Utc::now();
        client
            .set_mode(TankMode::Boost, start, start + chrono::Duration::minutes(45))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_device_maps_to_not_found() {
        let mut server = Server::new_async().await;
        login_mock(&mut server).create_async().await;
        server
            .mock("GET", "/devices/77/water")
            .with_status(404)
            .create_async()
            .await;

        let client = TankClient::new(server.url(), "a@b.c", "pw", "77").unwrap();
        assert!(matches!(
            client.water().await,
            Err(AdapterError::DeviceNotFound(_))
        ));
    }
}
