// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use crate::traits::MonitorSink;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A service missing its heartbeat for this long is considered hung.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum HeartbeatEvent {
    Register { name: String, timeout: Duration },
    Kick { name: String },
    Unregister { name: String },
}

/// Liveness watchdog.
///
/// Services register and then kick once per cycle. A service that stops
/// kicking for its timeout is flagged: the expiry is logged and recorded
/// as a health fact. Killing and restarting the hung process is external
/// supervision policy.
pub struct Watchdog {
    receiver: Receiver<HeartbeatEvent>,
    monitor: Arc<dyn MonitorSink>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").finish()
    }
}

/// Cheap cloneable handle services heartbeat through.
///
/// Sends never block: when the watchdog cannot keep up the event is
/// dropped with a log line, because a heartbeat must never stall the
/// control loop that emits it.
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    sender: Sender<HeartbeatEvent>,
}

impl WatchdogHandle {
    pub fn register(&self, name: &str) {
        self.register_with_timeout(name, DEFAULT_TIMEOUT);
    }

    pub fn register_with_timeout(&self, name: &str, timeout: Duration) {
        self.send(HeartbeatEvent::Register {
            name: name.to_owned(),
            timeout,
        });
    }

    pub fn kick(&self, name: &str) {
        self.send(HeartbeatEvent::Kick {
            name: name.to_owned(),
        });
    }

    pub fn unregister(&self, name: &str) {
        self.send(HeartbeatEvent::Unregister {
            name: name.to_owned(),
        });
    }

    fn send(&self, event: HeartbeatEvent) {
        if let Err(err) = self.sender.try_send(event) {
            warn!("Watchdog unreachable, heartbeat dropped: {err}");
        }
    }
}

struct Entry {
    timeout: Duration,
    deadline: Instant,
    expired: bool,
}

impl Watchdog {
    /// Spawn the watchdog sweep thread and return the heartbeat handle.
    pub fn spawn(monitor: Arc<dyn MonitorSink>) -> WatchdogHandle {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        let watchdog = Watchdog { receiver, monitor };
        if let Err(err) = std::thread::Builder::new()
            .name("watchdog".to_owned())
            .spawn(move || watchdog.run())
        {
            error!("Failed to spawn the watchdog thread: {err}");
        }
        WatchdogHandle { sender }
    }

    fn run(self) {
        let mut entries: HashMap<String, Entry> = HashMap::new();
        loop {
            match self.receiver.recv_timeout(Duration::from_secs(1)) {
                Ok(event) => self.apply(&mut entries, event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.sweep(&mut entries);
        }
        debug!("All watchdog handles dropped, stopping the sweep");
    }

    fn apply(&self, entries: &mut HashMap<String, Entry>, event: HeartbeatEvent) {
        match event {
            HeartbeatEvent::Register { name, timeout } => {
                entries.entry(name.clone()).or_insert_with(|| {
                    debug!("Start monitoring {name}");
                    Entry {
                        timeout,
                        deadline: Instant::now() + timeout,
                        expired: false,
                    }
                });
            }
            HeartbeatEvent::Kick { name } => {
                if let Some(entry) = entries.get_mut(&name) {
                    entry.deadline = Instant::now() + entry.timeout;
                    if entry.expired {
                        entry.expired = false;
                        self.monitor.track(&name, true);
                        debug!("{name} is heartbeating again");
                    }
                } else {
                    warn!("Kick from unregistered service {name}");
                }
            }
            HeartbeatEvent::Unregister { name } => {
                if entries.remove(&name).is_some() {
                    debug!("Stop monitoring {name}");
                }
            }
        }
    }

    fn sweep(&self, entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        for (name, entry) in entries.iter_mut() {
            if !entry.expired && now > entry.deadline {
                entry.expired = true;
                error!(
                    "{name} has not heartbeated for {}s",
                    entry.timeout.as_secs()
                );
                self.monitor.track(name, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingMonitor {
        facts: Mutex<Vec<(String, bool)>>,
    }

    impl MonitorSink for RecordingMonitor {
        fn track(&self, name: &str, healthy: bool) {
            self.facts.lock().push((name.to_owned(), healthy));
        }
    }

    #[test]
    fn test_expiry_and_recovery_are_tracked() {
        let monitor = Arc::new(RecordingMonitor::default());
        let handle = Watchdog::spawn(monitor.clone());

        handle.register_with_timeout("pool_pump", Duration::from_millis(50));
        handle.kick("pool_pump");
        std::thread::sleep(Duration::from_millis(1300));
        handle.kick("pool_pump");
        std::thread::sleep(Duration::from_millis(1300));

        let facts = monitor.facts.lock().clone();
        assert!(facts.contains(&("pool_pump".to_owned(), false)));
        assert!(facts.contains(&("pool_pump".to_owned(), true)));
    }
}
