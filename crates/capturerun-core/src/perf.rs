//! Performance telemetry reported for a running capture VM.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One performance sample for the VM backing a task.
///
/// Counter values are in the units the hypervisor reports: cpu in
/// hundredths of a percent (6030 = 60.3%), net and disk in KBps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Hypervisor sampling interval in seconds; unknown while `None` or 0.
    pub refresh_rate_secs: Option<u32>,

    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,

    pub cpu: Option<i64>,
    pub net: Option<i64>,
    pub disk: Option<i64>,
}

impl PerformanceSample {
    pub fn new(refresh_rate_secs: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            refresh_rate_secs: Some(refresh_rate_secs),
            timestamp,
            cpu: None,
            net: None,
            disk: None,
        }
    }

    pub fn with_cpu(mut self, cpu: i64) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_net(mut self, net: i64) -> Self {
        self.net = Some(net);
        self
    }

    pub fn with_disk(mut self, disk: i64) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Sampling interval if the hypervisor has reported a usable one.
    pub fn refresh_rate(&self) -> Option<u32> {
        self.refresh_rate_secs.filter(|rate| *rate > 0)
    }
}
