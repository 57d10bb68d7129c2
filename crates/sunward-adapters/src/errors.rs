// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use thiserror::Error;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors shared by the vendor cloud clients.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unexpected payload: {0}")]
    Payload(String),
}
