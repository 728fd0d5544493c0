//! Control plane configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stall::{StallConfig, StallThresholds};

/// Finished-task retention used when the configured cap is zero.
pub const DEFAULT_MAX_FINISHED: usize = 1000;

/// Scheduler limits that may change while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    /// Maximum concurrently running tasks; 0 is treated as 1.
    pub max_running: usize,

    /// Finished tasks retained before eviction; 0 selects the default.
    pub max_finished: usize,
}

impl QueueLimits {
    pub fn new(max_running: usize, max_finished: usize) -> Self {
        Self {
            max_running,
            max_finished,
        }
    }

    pub fn running(&self) -> usize {
        self.max_running.max(1)
    }

    pub fn finished(&self) -> usize {
        if self.max_finished == 0 {
            DEFAULT_MAX_FINISHED
        } else {
            self.max_finished
        }
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_running: 4,
            max_finished: 100,
        }
    }
}

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub http_addr: String,

    /// Name used to prefix scheduler log lines.
    pub queue_name: String,

    /// Initial scheduler limits.
    pub limits: QueueLimits,

    /// How long a cancelled job may take to wind down before it is aborted.
    pub abort_grace: Duration,

    /// Buffered events per subscriber before a slow one starts lagging.
    pub event_capacity: usize,

    /// Longest a job waits in a workpool queue for an instance.
    pub lease_wait_timeout: Duration,

    /// How often conversion jobs poll their backend.
    pub poll_interval: Duration,

    /// Stall detection thresholds and window.
    pub stall: StallConfig,
}

impl Default for Config {
    fn default() -> Self {
        let poll_interval = Duration::from_secs(5);
        Self {
            http_addr: "[::1]:50080".to_string(),
            queue_name: "capture".to_string(),
            limits: QueueLimits::default(),
            abort_grace: Duration::from_secs(10),
            event_capacity: 1024,
            lease_wait_timeout: Duration::from_secs(600),
            poll_interval,
            stall: StallConfig {
                thresholds: StallThresholds::default(),
                timeout: Duration::from_secs(1200),
                poll_interval,
            },
        }
    }
}
