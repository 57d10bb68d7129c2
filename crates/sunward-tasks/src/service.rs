// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sunward_core::{MonitorSink, SchedulerControl, TaskRegistry, WatchdogHandle};

/// Shared plumbing handed to every task service loop.
#[derive(Clone)]
pub struct TaskServiceContext {
    pub registry: Arc<TaskRegistry>,
    pub scheduler: Arc<dyn SchedulerControl>,
    pub watchdog: WatchdogHandle,
    pub monitor: Arc<dyn MonitorSink>,
}

impl std::fmt::Debug for TaskServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskServiceContext").finish()
    }
}

/// Single-slot time-to-live cache for device cloud snapshots.
///
/// Device queries arrive in bursts (the scheduler asks several questions
/// per cycle); one short-lived snapshot answers them all without another
/// round trip.
#[derive(Debug)]
pub struct Ttl<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> Ttl<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<T> {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, value: T) {
        *self.slot.lock() = Some((Instant::now(), value));
    }

    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }
}
