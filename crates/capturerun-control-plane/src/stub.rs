//! Delay-based collaborators for running the control plane without a
//! hypervisor (dry-run mode).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use capturerun_core::{
    CaptureRequest, ConversionStatus, Instance, InstanceId, Lease, PerformanceSample, WorkpoolId,
};

use crate::conversion::{BackendError, ConversionBackend, ConverterStatus};
use crate::manual::{CaptureError, Capturer, SnapshotPhase};
use crate::workpool::{ProvisionError, Provisioner};

/// Capturer whose every phase takes a fixed delay.
pub struct StubCapturer {
    delay: Duration,
    next_project: AtomicI64,
}

impl StubCapturer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_project: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl Capturer for StubCapturer {
    async fn power_on(&self, lease: &Lease) -> Result<(), CaptureError> {
        debug!(vm = %lease.instance_name, "Stub power on");
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn wait_for_tools(&self, lease: &Lease) -> Result<(), CaptureError> {
        debug!(vm = %lease.instance_name, "Stub waiting for tools");
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn take_snapshot(&self, lease: &Lease, phase: SnapshotPhase) -> Result<(), CaptureError> {
        debug!(vm = %lease.instance_name, ?phase, "Stub snapshot");
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn generate_project(
        &self,
        lease: &Lease,
        request: &CaptureRequest,
    ) -> Result<i64, CaptureError> {
        debug!(vm = %lease.instance_name, app = %request.display_name, "Stub generating project");
        tokio::time::sleep(self.delay).await;
        Ok(self.next_project.fetch_add(1, Ordering::Relaxed))
    }

    async fn build_project(&self, lease: &Lease, project_id: i64) -> Result<(), CaptureError> {
        debug!(vm = %lease.instance_name, project_id, "Stub building project");
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

const STUB_STAGES: [ConversionStatus; 8] = [
    ConversionStatus::Downloading,
    ConversionStatus::PreCapture,
    ConversionStatus::Install,
    ConversionStatus::PostCapture,
    ConversionStatus::Generate,
    ConversionStatus::Build,
    ConversionStatus::Finishing,
    ConversionStatus::Complete,
];

/// Converter that walks every stage, spending a fixed delay in each.
pub struct StubConverter {
    stage_delay: Duration,
    jobs: Mutex<HashMap<String, Instant>>,
    next_job: AtomicU64,
}

impl StubConverter {
    pub fn new(stage_delay: Duration) -> Self {
        Self {
            stage_delay,
            jobs: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(1),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ConversionBackend for StubConverter {
    async fn submit(&self, lease: &Lease, request: &CaptureRequest) -> Result<String, BackendError> {
        let job = format!("stub-{}", self.next_job.fetch_add(1, Ordering::Relaxed));
        debug!(job = %job, vm = %lease.instance_name, app = %request.display_name, "Stub conversion submitted");
        self.jobs().insert(job.clone(), Instant::now());
        Ok(job)
    }

    async fn poll(&self, job: &str) -> Result<ConverterStatus, BackendError> {
        let Some(started) = self.jobs().get(job).copied() else {
            return Err(BackendError(format!("unknown job {job}")));
        };

        let delay = self.stage_delay.as_millis().max(1);
        let index = (started.elapsed().as_millis() / delay) as usize;
        let index = index.min(STUB_STAGES.len() - 1);
        let stage = STUB_STAGES[index];
        if stage == ConversionStatus::Complete {
            self.jobs().remove(job);
        }

        let percent = (index * 100 / (STUB_STAGES.len() - 1)) as i32;
        let sample = PerformanceSample::new(1, chrono::Utc::now())
            .with_cpu(2500)
            .with_net(120)
            .with_disk(300);
        Ok(ConverterStatus::new(stage)
            .with_percent(percent)
            .with_performance(sample))
    }

    async fn cancel(&self, job: &str) -> Result<(), BackendError> {
        self.jobs().remove(job);
        Ok(())
    }
}

/// Provisioner that "creates" a VM after a fixed delay.
pub struct StubProvisioner {
    delay: Duration,
}

impl StubProvisioner {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Provisioner for StubProvisioner {
    async fn provision(
        &self,
        workpool: &WorkpoolId,
        instance: InstanceId,
    ) -> Result<String, ProvisionError> {
        tokio::time::sleep(self.delay).await;
        Ok(format!("{workpool}-vm{instance}"))
    }

    async fn deprovision(&self, instance: &Instance) -> Result<(), ProvisionError> {
        debug!(vm = %instance.name, "Stub deprovision");
        Ok(())
    }
}
