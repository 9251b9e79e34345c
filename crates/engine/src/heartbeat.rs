// SPDX-License-Identifier: Apache-2.0

//! Heartbeat bookkeeping.
//!
//! The heart publishes a heartbeat on the control topic at a fixed
//! interval. Every component records the last-seen heartbeat; once the
//! silence exceeds the timeout the component performs an internal
//! termination. This is the only mechanism by which a descendant detects
//! root failure across the process boundary.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tracks the last observed heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    last: Arc<Mutex<Instant>>,
    timeout: Duration,
}

impl HeartbeatMonitor {
    /// A monitor that considers the current moment as the last heartbeat.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
            timeout,
        }
    }

    /// Records a heartbeat.
    pub fn beat(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last heartbeat.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last.lock().elapsed()
    }

    /// `true` once the silence exceeds the timeout.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.silence() > self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_resets_the_silence() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(50));
        assert!(!monitor.expired());

        std::thread::sleep(Duration::from_millis(80));
        assert!(monitor.expired());

        monitor.beat();
        assert!(!monitor.expired());
    }
}
