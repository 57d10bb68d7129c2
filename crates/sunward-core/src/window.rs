// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use std::collections::VecDeque;
use sunward_types::{PowerRecord, TaskDescriptor};

/// Sliding window of recent power records with coverage analysis.
///
/// The window answers how much of a task's consumption is, or would be,
/// covered by the local production, under hypothetical rewrites of the
/// latest records: pretend some tasks draw exactly their minimum power,
/// pretend others are off.
#[derive(Debug, Clone)]
pub struct PowerUsageWindow {
    capacity: usize,
    ignore_power_threshold: f32,
    records: VecDeque<PowerRecord>,
}

impl PowerUsageWindow {
    /// `capacity` bounds the number of retained records;
    /// `ignore_power_threshold` squashes values in `(0, threshold)` kW to
    /// zero on ingest, discarding sensor noise and trickle loads.
    pub fn new(capacity: usize, ignore_power_threshold: f32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ignore_power_threshold,
            records: VecDeque::with_capacity(capacity),
        }
    }

    /// Drop all records. Called on resume from paused mode so decisions are
    /// not made on pre-outage data.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Queue a new record, evicting the oldest on overflow.
    pub fn update(&mut self, mut record: PowerRecord) {
        record.squash_noise(self.ignore_power_threshold);
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&PowerRecord> {
        self.records.back()
    }

    /// Power used by `task` in the latest record, never negative.
    pub fn power_used_by(&self, task: &TaskDescriptor) -> f32 {
        self.records
            .back()
            .map(|record| task.usage(record))
            .unwrap_or(0.0)
    }

    /// Rewrite `record` as if `task` were drawing exactly its minimum power.
    fn minimize(task: &TaskDescriptor, record: &mut PowerRecord) {
        let usage = record.sum_of(&task.keys);
        record.add_to_net(-usage);
        record.spread_over(&task.keys, task.power);
        record.add_to_net(task.power);
    }

    /// Rewrite `record` as if `task` were off.
    fn suppress(task: &TaskDescriptor, record: &mut PowerRecord) {
        let usage = record.sum_of(&task.keys);
        record.add_to_net(-usage);
        record.spread_over(&task.keys, 0.0);
    }

    /// Ratio of `task.power` the production surplus could cover if the task
    /// were started now, computed on the latest record.
    ///
    /// Tasks in `minimum` are rewritten to draw exactly their minimum power;
    /// tasks in `ignore` are rewritten to be off.
    pub fn available_for(
        &self,
        task: &TaskDescriptor,
        minimum: &[TaskDescriptor],
        ignore: &[TaskDescriptor],
    ) -> f32 {
        let Some(latest) = self.records.back() else {
            return 0.0;
        };
        let mut record = latest.clone();
        for other in minimum {
            Self::minimize(other, &mut record);
        }
        for other in ignore {
            Self::suppress(other, &mut record);
        }
        if task.power <= 0.0 {
            return 1.0;
        }
        (-record.net() / task.power).max(0.0)
    }

    /// Ratio of the power `task` consumed that the production covered,
    /// accumulated over the most recent stretch of records during which the
    /// task was drawing power.
    ///
    /// The per-task rewrites of `minimize` and `ignore` are applied to each
    /// record, but only for tasks that were drawing power in that record.
    /// Returns 1.0 when the task has no usage to evaluate.
    pub fn covered_by_production(
        &self,
        task: &TaskDescriptor,
        minimize: &[TaskDescriptor],
        ignore: &[TaskDescriptor],
    ) -> f32 {
        let Some(latest) = self.records.back() else {
            return 1.0;
        };
        if task.usage(latest) == 0.0 {
            return 1.0;
        }
        let mut accumulator = PowerRecord::new();
        for record in self.records.iter().rev() {
            if task.usage(record) == 0.0 {
                break;
            }
            let mut rewritten = record.clone();
            for other in minimize {
                if other.usage(record) > 0.0 {
                    Self::minimize(other, &mut rewritten);
                }
            }
            for other in ignore {
                if other.usage(record) > 0.0 {
                    Self::suppress(other, &mut rewritten);
                }
            }
            accumulator.merge_add(&rewritten);
        }
        let total = task.usage(&accumulator);
        if total == 0.0 {
            return 1.0;
        }
        (-(accumulator.net() - total) / total).max(0.0)
    }
}
