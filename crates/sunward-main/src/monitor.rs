// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use std::sync::Arc;
use sunward_core::{MonitorSink, Store};
use tracing::{info, warn};

const STORE_SERVICE: &str = "monitor";

/// Monitor sink persisting boolean health facts to the store.
///
/// Transitions are logged; an external alerting pipeline reads the facts
/// and escalates repeated failures to the operator.
#[derive(Debug)]
pub struct StoreMonitor {
    store: Arc<Store>,
}

impl StoreMonitor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl MonitorSink for StoreMonitor {
    fn track(&self, name: &str, healthy: bool) {
        let previous: Option<bool> = self.store.get(STORE_SERVICE, name).ok().flatten();
        if previous != Some(healthy) {
            if healthy {
                info!("health: {name} recovered");
            } else {
                warn!("health: {name} failing");
            }
        }
        if let Err(err) = self.store.put(STORE_SERVICE, name, &healthy) {
            warn!("Failed to persist the {name} health fact: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facts_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = Arc::new(Store::open(path.to_str().unwrap()).unwrap());
        let monitor = StoreMonitor::new(store.clone());
        monitor.track("tank cloud", true);
        monitor.track("tank cloud", false);
        let fact: Option<bool> = store.get(STORE_SERVICE, "tank cloud").unwrap();
        assert_eq!(fact, Some(false));
    }
}
