// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task priority levels, ordered from least to most important.
///
/// Tasks adjust their own priority; the scheduler only reads it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    /// All levels, ascending.
    pub const ALL: [Priority; 4] = [Self::Low, Self::Medium, Self::High, Self::Urgent];

    /// Numeric level, 1 (LOW) through 4 (URGENT).
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            4 => Some(Self::Urgent),
            _ => None,
        }
    }

    /// One level up, saturating at URGENT.
    pub fn raised(self) -> Self {
        Self::from_level(self.level() + 1).unwrap_or(Self::Urgent)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Low
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(anyhow::anyhow!("Unknown priority: '{}'", s)),
        }
    }
}

/// Arithmetic mean of a set of priorities, 0.0 when empty.
pub fn mean_level<I: IntoIterator<Item = Priority>>(priorities: I) -> f32 {
    let mut sum = 0u32;
    let mut count = 0u32;
    for priority in priorities {
        sum += u32::from(priority.level());
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum as f32 / count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low < Priority::Medium);
        assert_eq!(Priority::High.level(), 3);
    }

    #[test]
    fn test_raised_saturates() {
        assert_eq!(Priority::Low.raised(), Priority::Medium);
        assert_eq!(Priority::Urgent.raised(), Priority::Urgent);
    }

    #[test]
    fn test_mean_level() {
        assert_eq!(mean_level([]), 0.0);
        assert_eq!(mean_level([Priority::Low, Priority::High]), 2.0);
    }
}
