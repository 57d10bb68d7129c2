// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Channel carrying the whole-home net power.
///
/// Positive means importing from the grid, negative means exporting.
pub const NET_CHANNEL: &str = "net";

/// Channel carrying the aggregate production, negative by convention.
pub const SOLAR_CHANNEL: &str = "solar";

/// Time resolution of a sensor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordScale {
    /// Instantaneous reading refreshed every second.
    Second,
    /// One-minute average, the resolution the scheduler works with.
    Minute,
    /// Day-scale aggregate, expressed in kWh instead of kW.
    Day,
}

impl RecordScale {
    /// Unit of the values carried by a record at this scale.
    pub fn unit(self) -> &'static str {
        match self {
            Self::Second | Self::Minute => "kW",
            Self::Day => "kWh",
        }
    }

    /// Query-parameter value used by the sensor HTTP APIs.
    pub fn as_query_value(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Day => "day",
        }
    }
}

impl fmt::Display for RecordScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_query_value())
    }
}

impl FromStr for RecordScale {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "day" => Ok(Self::Day),
            _ => Err(anyhow::anyhow!("Unknown record scale: '{}'", s)),
        }
    }
}

/// A single metering snapshot mapping channel names to signed power values.
///
/// The mandatory channel is `net`; `solar` conventionally carries the sum of
/// the producing channels with negative sign. Every other key names a
/// measured load. For any record, `net ≈ Σ load channels + solar`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PowerRecord {
    channels: BTreeMap<String, f32>,
}

impl PowerRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a channel, `None` when the channel is absent.
    pub fn get(&self, key: &str) -> Option<f32> {
        self.channels.get(key).copied()
    }

    /// Net power; zero when the channel is absent.
    pub fn net(&self) -> f32 {
        self.get(NET_CHANNEL).unwrap_or(0.0)
    }

    pub fn set(&mut self, key: impl Into<String>, value: f32) {
        self.channels.insert(key.into(), value);
    }

    pub fn add_to_net(&mut self, delta: f32) {
        let net = self.net();
        self.set(NET_CHANNEL, net + delta);
    }

    /// Sum of the listed channels; absent channels count as zero.
    pub fn sum_of(&self, keys: &[String]) -> f32 {
        keys.iter().filter_map(|key| self.get(key)).sum()
    }

    /// Split `total` equally over the listed channels.
    pub fn spread_over(&mut self, keys: &[String], total: f32) {
        if keys.is_empty() {
            return;
        }
        let share = total / keys.len() as f32;
        for key in keys {
            self.set(key.clone(), share);
        }
    }

    /// Add every channel of `other` into this record, channel-wise.
    pub fn merge_add(&mut self, other: &PowerRecord) {
        for (key, value) in other.channels() {
            let current = self.get(key).unwrap_or(0.0);
            self.set(key, current + value);
        }
    }

    /// Coerce values inside `(0, threshold)` to zero.
    ///
    /// Suppresses sensor noise and trickle loads such as a condenser keeping
    /// its circuitry warm in cold weather.
    pub fn squash_noise(&mut self, threshold: f32) {
        for value in self.channels.values_mut() {
            if *value > 0.0 && *value < threshold {
                *value = 0.0;
            }
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = (&str, f32)> {
        self.channels.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl FromIterator<(String, f32)> for PowerRecord {
    fn from_iter<I: IntoIterator<Item = (String, f32)>>(iter: I) -> Self {
        Self {
            channels: iter.into_iter().collect(),
        }
    }
}

impl<const N: usize> From<[(&str, f32); N]> for PowerRecord {
    fn from(entries: [(&str, f32); N]) -> Self {
        entries
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value))
            .collect()
    }
}
