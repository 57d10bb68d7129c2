// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use anyhow::Result;
use async_trait::async_trait;
use sunward_types::TaskDescriptor;

/// Contract every managed load implements.
///
/// A task is usually coupled to one appliance. It declares a priority, a
/// minimum power and the power-record channels that measure it (the
/// descriptor), and implements the start/stop control methods plus the
/// feedback methods that guide the scheduler.
///
/// `start()` must always lead to the actual start of the appliance; if the
/// appliance cannot or should not be started anymore, `is_runnable()` MUST
/// return false so the scheduler can make an educated decision. `stop()`
/// may have no physical effect while a mandatory minimum runtime is still
/// active, in which case `is_stoppable()` must already return false.
///
/// Every method is fallible: the scheduler treats an error as "task
/// temporarily unreachable" and skips the task for the cycle.
#[async_trait]
pub trait LoadTask: Send + Sync {
    /// Materialize the task descriptor: priority, minimum power, metering
    /// keys and the auto-adjust flag.
    async fn descriptor(&self) -> Result<TaskDescriptor>;

    /// Start the task. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stop the task. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// True if a `start()` would cause the appliance to begin drawing
    /// power. Must not consider power availability.
    async fn is_runnable(&self) -> Result<bool>;

    /// Actual appliance state, with bounded staleness.
    async fn is_running(&self) -> Result<bool>;

    /// True if a `stop()` would take effect within one scheduler cycle.
    async fn is_stoppable(&self) -> Result<bool>;

    /// The task's own acceptance predicate. `ratio` is the production
    /// coverage (historical when running, hypothetical when considering a
    /// start); `power` is the current instantaneous usage. Tasks combine
    /// these with internal state and typically accept lower ratios to keep
    /// running than to start.
    async fn meet_running_criteria(&self, ratio: f32, power: f32) -> Result<bool>;

    /// One-line human status: task name, priority, appliance specifics.
    async fn desc(&self) -> Result<String>;
}
