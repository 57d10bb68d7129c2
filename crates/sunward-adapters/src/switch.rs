// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::errors::{AdapterError, AdapterResult};
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// A smart switch as reported by the vendor cloud.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchDevice {
    pub deviceid: String,
    pub online: bool,
    pub params: SwitchParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchParams {
    /// "on" or "off".
    pub switch: String,
}

impl SwitchDevice {
    pub fn is_on(&self) -> bool {
        self.params.switch == "on"
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    error: i64,
    #[serde(default)]
    at: String,
}

const CALL_ATTEMPTS: u32 = 2;

/// Cloud client of the relay switch driving the pool pump.
///
/// The cloud wraps every payload in an envelope with a vendor error code;
/// code 406 means an expired session and triggers a re-login.
pub struct SwitchClient {
    base_url: String,
    login: String,
    password: String,
    client: Client,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for SwitchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl SwitchClient {
    pub fn new(
        base_url: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| AdapterError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            login: login.into(),
            password: password.into(),
            client,
            token: Mutex::new(None),
        })
    }

    async fn do_login(&self) -> AdapterResult<()> {
        let url = format!("{}/api/user/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({"email": self.login, "password": self.password}))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(AdapterError::AuthenticationFailed);
        }
        let login = response.json::<LoginResponse>().await?;
        if login.error != 0 || login.at.is_empty() {
            return Err(AdapterError::AuthenticationFailed);
        }
        *self.token.lock() = Some(login.at);
        debug!("Switch cloud session renewed");
        Ok(())
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AdapterResult<T> {
        for attempt in 0..=CALL_ATTEMPTS {
            if self.token.lock().is_none() {
                self.do_login().await?;
            }
            let token = self.token.lock().clone().unwrap_or_default();
            let url = format!("{}{}", self.base_url, path);
            let mut request = self.client.request(method.clone(), &url).bearer_auth(token);
            if let Some(body) = &body {
                request = request.json(body);
            }
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!("Switch call failed (attempt {attempt}): {err}");
                    if attempt >= CALL_ATTEMPTS {
                        return Err(AdapterError::Http(err));
                    }
                    continue;
                }
            };
            if !response.status().is_success() {
                return Err(AdapterError::Api {
                    status: response.status().as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            // Every payload is wrapped in an envelope carrying a vendor
            // error code; 406 means the session expired.
            let envelope = response.json::<serde_json::Value>().await?;
            let code = envelope.get("error").and_then(serde_json::Value::as_i64).unwrap_or(0);
            if code == 406 {
                warn!("Switch session expired, logging in again");
                *self.token.lock() = None;
                continue;
            }
            if code != 0 {
                return Err(AdapterError::Api {
                    status: 200,
                    message: format!("vendor error {code}"),
                });
            }
            return serde_json::from_value::<T>(envelope)
                .map_err(|err| AdapterError::Payload(err.to_string()));
        }
        Err(AdapterError::AuthenticationFailed)
    }

    /// State of one switch.
    pub async fn device(&self, device_id: &str) -> AdapterResult<SwitchDevice> {
        self.call::<SwitchDevice>(
            Method::GET,
            &format!("/api/user/device/{device_id}"),
            None,
        )
        .await
    }

    /// Drive the relay on or off.
    pub async fn set_switch(&self, device_id: &str, on: bool) -> AdapterResult<()> {
        let state = if on { "on" } else { "off" };
        self.call::<serde_json::Value>(
            Method::POST,
            "/api/user/device/status",
            Some(json!({
                "deviceid": device_id,
                "params": {"switch": state},
            })),
        )
        .await?;
        Ok(())
    }
}
