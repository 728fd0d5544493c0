//! Operations a manual capture performs on its leased VM.

use async_trait::async_trait;
use thiserror::Error;

use capturerun_core::{CaptureRequest, Lease};

use crate::scheduler::JobError;

/// Failure reported by a capturer.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CaptureError(pub String);

impl From<CaptureError> for JobError {
    fn from(e: CaptureError) -> Self {
        JobError::Capture(e.0)
    }
}

/// Which side of the installation a snapshot records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    PreCapture,
    PostCapture,
}

/// Hypervisor and packaging operations driven by the manual capture job.
#[async_trait]
pub trait Capturer: Send + Sync + 'static {
    async fn power_on(&self, lease: &Lease) -> Result<(), CaptureError>;

    /// Resolves once the guest tools report the VM ready.
    async fn wait_for_tools(&self, lease: &Lease) -> Result<(), CaptureError>;

    async fn take_snapshot(&self, lease: &Lease, phase: SnapshotPhase) -> Result<(), CaptureError>;

    /// Diff the snapshots into a project; returns the project id.
    async fn generate_project(
        &self,
        lease: &Lease,
        request: &CaptureRequest,
    ) -> Result<i64, CaptureError>;

    async fn build_project(&self, lease: &Lease, project_id: i64) -> Result<(), CaptureError>;
}
