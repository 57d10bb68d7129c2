// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::task::LoadTask;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Name registry for task services.
///
/// Task services register under a `task.<name>` URI every cycle; the
/// scheduler stores the URIs and materializes handles from the registry
/// each cycle, so a vanished service simply stops resolving. Registration
/// is idempotent and re-registration is expected.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<BTreeMap<String, Arc<dyn LoadTask>>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("uris", &self.uris())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Qualified URI for a task name.
    pub fn task_uri(name: &str) -> String {
        format!("task.{name}")
    }

    pub fn register(&self, uri: &str, handle: Arc<dyn LoadTask>) {
        let mut tasks = self.tasks.write();
        if tasks.insert(uri.to_owned(), handle).is_none() {
            debug!("Registered {uri}");
        }
    }

    pub fn unregister(&self, uri: &str) {
        if self.tasks.write().remove(uri).is_some() {
            debug!("Unregistered {uri}");
        }
    }

    pub fn lookup(&self, uri: &str) -> Option<Arc<dyn LoadTask>> {
        self.tasks.read().get(uri).cloned()
    }

    pub fn uris(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use sunward_types::{Priority, TaskDescriptor};

    struct NullTask;

    #[async_trait]
    impl LoadTask for NullTask {
        async fn descriptor(&self) -> Result<TaskDescriptor> {
            Ok(TaskDescriptor {
                priority: Priority::Low,
                power: 1.0,
                keys: vec!["null".to_owned()],
                auto_adjust: false,
            })
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn is_runnable(&self) -> Result<bool> {
            Ok(false)
        }

        async fn is_running(&self) -> Result<bool> {
            Ok(false)
        }

        async fn is_stoppable(&self) -> Result<bool> {
            Ok(true)
        }

        async fn meet_running_criteria(&self, _ratio: f32, _power: f32) -> Result<bool> {
            Ok(false)
        }

        async fn desc(&self) -> Result<String> {
            Ok("Null(LOW)".to_owned())
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = TaskRegistry::new();
        let uri = TaskRegistry::task_uri("null");
        registry.register(&uri, Arc::new(NullTask));
        registry.register(&uri, Arc::new(NullTask));
        assert_eq!(registry.uris(), vec!["task.null".to_owned()]);
        assert!(registry.lookup(&uri).is_some());
        registry.unregister(&uri);
        assert!(registry.lookup(&uri).is_none());
    }
}
