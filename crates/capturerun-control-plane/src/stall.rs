//! Stall detection for running captures.
//!
//! A job is considered stalled once a full window of consecutive performance
//! samples has stayed below every activity threshold. The window length is
//! `ceil(timeout / max(poll_interval, refresh_rate))` samples, so a stall is
//! reported after roughly `timeout` of inactivity regardless of how often the
//! hypervisor refreshes its counters.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use capturerun_core::PerformanceSample;

/// Activity thresholds; a sample above any of them counts as progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallThresholds {
    /// CPU usage in hundredths of a percent.
    pub cpu: i64,
    /// Network throughput in KBps.
    pub net: i64,
    /// Disk throughput in KBps.
    pub disk: i64,
}

impl Default for StallThresholds {
    fn default() -> Self {
        Self {
            cpu: 500,
            net: 10,
            disk: 10,
        }
    }
}

/// Stall detection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallConfig {
    pub thresholds: StallThresholds,
    /// How long a job must stay idle to be reported stalled.
    pub timeout: Duration,
    /// How often samples are taken by the job.
    pub poll_interval: Duration,
}

/// Stall window errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StallError {
    #[error("Stall timeout must be positive")]
    ZeroTimeout,

    #[error("Sampling interval must be positive")]
    ZeroInterval,
}

/// Sliding window of consecutive idle samples.
///
/// Only the count and the newest timestamp are needed: any sample that
/// breaks the run of idle samples clears the window.
#[derive(Debug)]
struct IdleWindow {
    thresholds: StallThresholds,
    update_ms: i64,
    capacity: usize,
    head: Option<chrono::DateTime<chrono::Utc>>,
    size: usize,
}

impl IdleWindow {
    fn new(config: &StallConfig, refresh_rate_secs: u32) -> Result<Self, StallError> {
        let timeout_ms = i64::try_from(config.timeout.as_millis()).unwrap_or(i64::MAX);
        if timeout_ms <= 0 {
            return Err(StallError::ZeroTimeout);
        }
        let poll_ms = i64::try_from(config.poll_interval.as_millis()).unwrap_or(i64::MAX);
        let update_ms = poll_ms.max(i64::from(refresh_rate_secs) * 1000);
        if update_ms <= 0 {
            return Err(StallError::ZeroInterval);
        }

        let capacity = (timeout_ms + update_ms - 1) / update_ms;
        Ok(Self {
            thresholds: config.thresholds,
            update_ms,
            capacity: usize::try_from(capacity).unwrap_or(usize::MAX).max(1),
            head: None,
            size: 0,
        })
    }

    fn add(&mut self, sample: &PerformanceSample) {
        let Some(head) = self.head.filter(|_| self.size > 0) else {
            self.push(sample);
            return;
        };

        if sample.timestamp < head {
            debug!("Stall window: sample older than head, clearing");
            self.clear();
        } else if sample.timestamp == head {
            // Same refresh period reported twice
        } else {
            let gap_ms = (sample.timestamp - head).num_milliseconds();
            if gap_ms >= 2 * self.update_ms {
                debug!(gap_ms, "Stall window: gap in samples, clearing");
                self.clear();
            }
            self.push(sample);
        }
    }

    fn push(&mut self, sample: &PerformanceSample) {
        let limits = &self.thresholds;
        let idle = match (sample.cpu, sample.net) {
            (Some(cpu), Some(net)) => {
                cpu <= limits.cpu
                    && net <= limits.net
                    && sample.disk.map_or(true, |disk| disk <= limits.disk)
            }
            _ => false,
        };

        if !idle {
            self.clear();
            return;
        }

        self.head = Some(sample.timestamp);
        self.size = (self.size + 1).min(self.capacity);
    }

    fn clear(&mut self) {
        self.head = None;
        self.size = 0;
    }

    fn is_full(&self) -> bool {
        self.size >= self.capacity
    }
}

/// Per-task stall detector.
///
/// The window is created lazily from the first sample that carries a usable
/// refresh rate; until then samples are ignored.
#[derive(Debug)]
pub struct StallDetector {
    config: StallConfig,
    window: Option<IdleWindow>,
}

impl StallDetector {
    pub fn new(config: StallConfig) -> Self {
        Self {
            config,
            window: None,
        }
    }

    /// Feed one performance sample.
    pub fn add_sample(&mut self, sample: &PerformanceSample) {
        if self.window.is_none() {
            let Some(rate) = sample.refresh_rate() else {
                return;
            };
            match IdleWindow::new(&self.config, rate) {
                Ok(window) => self.window = Some(window),
                Err(e) => {
                    warn!(error = %e, "Ignoring performance sample");
                    return;
                }
            }
        }

        if let Some(window) = self.window.as_mut() {
            window.add(sample);
        }
    }

    /// Returns true once a full window of idle samples has been seen.
    pub fn is_stalled(&self) -> bool {
        self.window.as_ref().is_some_and(IdleWindow::is_full)
    }

    /// Forget all samples seen so far.
    pub fn unstall(&mut self) {
        if let Some(window) = self.window.as_mut() {
            window.clear();
        }
    }

    /// Number of samples the window must hold to report a stall.
    pub fn capacity(&self) -> Option<usize> {
        self.window.as_ref().map(|w| w.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn config() -> StallConfig {
        StallConfig {
            thresholds: StallThresholds {
                cpu: 500,
                net: 10,
                disk: 10,
            },
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn idle(secs: i64) -> PerformanceSample {
        PerformanceSample::new(20, at(secs)).with_cpu(100).with_net(2)
    }

    #[test]
    fn test_capacity_uses_slower_interval() {
        let mut detector = StallDetector::new(config());
        detector.add_sample(&idle(0));
        // 60s / max(5s, 20s)
        assert_eq!(detector.capacity(), Some(3));

        let mut fast = config();
        fast.poll_interval = Duration::from_secs(25);
        let mut detector = StallDetector::new(fast);
        detector.add_sample(&idle(0));
        // ceil(60 / 25)
        assert_eq!(detector.capacity(), Some(3));
    }

    #[test]
    fn test_full_window_is_stalled() {
        let mut detector = StallDetector::new(config());
        detector.add_sample(&idle(0));
        detector.add_sample(&idle(20));
        assert!(!detector.is_stalled());
        detector.add_sample(&idle(40));
        assert!(detector.is_stalled());
        detector.add_sample(&idle(60));
        assert!(detector.is_stalled());
    }

    #[test]
    fn test_unstall_requires_a_new_full_window() {
        let mut detector = StallDetector::new(config());
        for t in [0, 20, 40] {
            detector.add_sample(&idle(t));
        }
        assert!(detector.is_stalled());

        detector.unstall();
        assert!(!detector.is_stalled());
        detector.add_sample(&idle(60));
        detector.add_sample(&idle(80));
        assert!(!detector.is_stalled());
        detector.add_sample(&idle(100));
        assert!(detector.is_stalled());
    }

    #[test]
    fn test_unknown_refresh_rate_is_ignored() {
        let mut detector = StallDetector::new(config());
        let mut sample = idle(0);
        sample.refresh_rate_secs = None;
        detector.add_sample(&sample);
        sample.refresh_rate_secs = Some(0);
        detector.add_sample(&sample);
        assert_eq!(detector.capacity(), None);
        assert!(!detector.is_stalled());
    }

    #[test]
    fn test_activity_clears_window() {
        let mut detector = StallDetector::new(config());
        detector.add_sample(&idle(0));
        detector.add_sample(&idle(20));
        detector.add_sample(&PerformanceSample::new(20, at(40)).with_cpu(6030).with_net(2));
        detector.add_sample(&idle(60));
        detector.add_sample(&idle(80));
        assert!(!detector.is_stalled());
    }

    #[test]
    fn test_disk_is_optional_but_checked() {
        let mut detector = StallDetector::new(config());
        detector.add_sample(&idle(0));
        detector.add_sample(&idle(20).with_disk(5));
        detector.add_sample(&idle(40).with_disk(500));
        detector.add_sample(&idle(60));
        assert!(!detector.is_stalled());
    }

    #[test]
    fn test_missing_required_counter_clears() {
        let mut detector = StallDetector::new(config());
        detector.add_sample(&idle(0));
        detector.add_sample(&idle(20));
        detector.add_sample(&PerformanceSample::new(20, at(40)).with_cpu(100));
        detector.add_sample(&idle(60));
        assert!(!detector.is_stalled());
    }

    #[test]
    fn test_out_of_order_and_gaps() {
        let mut detector = StallDetector::new(config());
        detector.add_sample(&idle(100));
        detector.add_sample(&idle(100));
        detector.add_sample(&idle(120));
        // older than head clears without inserting
        detector.add_sample(&idle(110));
        detector.add_sample(&idle(140));
        detector.add_sample(&idle(160));
        assert!(!detector.is_stalled());
        detector.add_sample(&idle(180));
        assert!(detector.is_stalled());

        // a gap of two update periods restarts the window
        detector.add_sample(&idle(220));
        assert!(!detector.is_stalled());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut bad = config();
        bad.timeout = Duration::ZERO;
        assert_eq!(IdleWindow::new(&bad, 20).unwrap_err(), StallError::ZeroTimeout);

        let mut detector = StallDetector::new(bad);
        detector.add_sample(&idle(0));
        assert!(!detector.is_stalled());
    }
}
