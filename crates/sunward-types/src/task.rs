// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::priority::Priority;
use crate::record::PowerRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Externally visible state of one managed load.
///
/// `power` is the minimum kilowatts the load needs to start and keep
/// running. `keys` lists the power-record channels that together measure
/// the load's consumption. An auto-adjust task can productively draw more
/// than `power` when surplus is available (an adjustable charger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub priority: Priority,
    pub power: f32,
    pub keys: Vec<String>,
    pub auto_adjust: bool,
}

impl TaskDescriptor {
    /// Power the task draws in `record`, never negative.
    pub fn usage(&self, record: &PowerRecord) -> f32 {
        record.sum_of(&self.keys).max(0.0)
    }

    /// True when the two tasks claim a common metering channel.
    ///
    /// Their shares of that channel cannot be attributed, so the scheduler
    /// never lets them run concurrently.
    pub fn shares_keys_with(&self, other: &TaskDescriptor) -> bool {
        self.keys.iter().any(|key| other.keys.contains(key))
    }
}

/// Strict importance ordering between two tasks.
///
/// Higher priority wins; among equals an auto-adjust task outranks a fixed
/// one; among those the larger minimum power wins. Full ties compare equal,
/// which makes preemption between them refuse.
pub fn importance_cmp(a: &TaskDescriptor, b: &TaskDescriptor) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.auto_adjust.cmp(&b.auto_adjust))
        .then(a.power.total_cmp(&b.power))
}
