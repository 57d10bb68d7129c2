// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Persistent key/value store shared by all services.
///
/// Keyed by `(service, key)`, values are JSON with owner-defined schema:
/// OAuth tokens, last known car state, daily runtime ledgers.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open the store: {path}"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                service     TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (service, key)
            );",
        )
        .context("Failed to initialize the store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn put<T: Serialize>(&self, service: &str, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize {service}/{key}"))?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO kv_store (service, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (service, key) DO UPDATE
                 SET value = excluded.value, updated_at = excluded.updated_at",
                params![service, key, json, Local::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to persist {service}/{key}"))?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, service: &str, key: &str) -> Result<Option<T>> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM kv_store WHERE service = ?1 AND key = ?2",
                params![service, key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read {service}/{key}"))?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json).with_context(|| {
                format!("Failed to deserialize {service}/{key}")
            })?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, service: &str, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM kv_store WHERE service = ?1 AND key = ?2",
                params![service, key],
            )
            .with_context(|| format!("Failed to delete {service}/{key}"))?;
        Ok(())
    }
}
