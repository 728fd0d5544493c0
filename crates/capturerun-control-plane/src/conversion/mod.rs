//! Automatic capture (conversion) job.

mod backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use capturerun_core::task::PROGRESS_INDETERMINATE;
use capturerun_core::{CaptureRequest, ConversionStatus, Lease, NewTask, TaskKind};

use crate::scheduler::{Job, JobContext, JobError, SchedulerError};
use crate::workpool::LeasePool;

pub use backend::{BackendError, ConversionBackend, ConverterStatus};

/// Errors submitting a conversion.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Task envelope for a conversion of `request`.
pub fn conversion_task(request: &CaptureRequest, record_id: Option<i64>) -> NewTask {
    let task = NewTask::new(TaskKind::Conversion, request.display_name.clone());
    match record_id {
        Some(record_id) => task.with_record(record_id),
        None => task,
    }
}

/// Leases a VM, hands the capture to the backend, and mirrors its progress
/// until it completes.
pub struct ConversionJob {
    request: CaptureRequest,
    pool: LeasePool,
    backend: Arc<dyn ConversionBackend>,
    poll_interval: Duration,
}

impl ConversionJob {
    pub fn new(
        request: CaptureRequest,
        pool: LeasePool,
        backend: Arc<dyn ConversionBackend>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            request,
            pool,
            backend,
            poll_interval,
        }
    }

    async fn convert(&self, ctx: &JobContext, lease: &Lease) -> Result<(), JobError> {
        ctx.update_status(ConversionStatus::Downloading)?;
        let job = tokio::select! {
            _ = ctx.cancelled() => return Err(JobError::Cancelled),
            job = self.backend.submit(lease, &self.request) => job?,
        };
        info!(task_id = %ctx.task_id(), job = %job, vm = %lease.instance_name, "Submitted conversion");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.cancel_backend(ctx, &job).await;
                    return Err(JobError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            let status = tokio::select! {
                _ = ctx.cancelled() => {
                    self.cancel_backend(ctx, &job).await;
                    return Err(JobError::Cancelled);
                }
                status = self.backend.poll(&job) => status?,
            };
            if let Some(sample) = &status.performance {
                if ctx.record_performance(sample) {
                    debug!(task_id = %ctx.task_id(), job = %job, "Conversion looks stalled");
                }
            }

            match status.stage {
                ConversionStatus::Complete => return Ok(()),
                ConversionStatus::Failed => {
                    let message = status
                        .error
                        .unwrap_or_else(|| "conversion failed".to_string());
                    return Err(JobError::Backend(message));
                }
                ConversionStatus::Cancelled => {
                    return Err(JobError::Backend("cancelled by the backend".to_string()));
                }
                ConversionStatus::NewTask | ConversionStatus::Queued => {
                    ctx.update_status_with_progress(ConversionStatus::Created, PROGRESS_INDETERMINATE)?;
                }
                stage => {
                    let progress = if stage.is_pending() {
                        PROGRESS_INDETERMINATE
                    } else {
                        status.percent.unwrap_or(PROGRESS_INDETERMINATE)
                    };
                    ctx.update_status_with_progress(stage, progress)?;
                }
            }
        }
    }

    async fn cancel_backend(&self, ctx: &JobContext, job: &str) {
        let _ = ctx.update_status(ConversionStatus::Cancelling);
        match self.backend.cancel(job).await {
            Ok(()) => info!(task_id = %ctx.task_id(), job = %job, "Cancelled conversion"),
            Err(e) => warn!(task_id = %ctx.task_id(), job = %job, error = %e, "Failed to cancel conversion"),
        }
    }
}

#[async_trait]
impl Job for ConversionJob {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        ctx.update_status_with_progress(ConversionStatus::Provisioning, PROGRESS_INDETERMINATE)?;
        let lease = tokio::select! {
            _ = ctx.cancelled() => return Err(JobError::Cancelled),
            lease = self.pool.lease(&self.request.workpool) => lease?,
        };

        let result = self.convert(&ctx, &lease).await;
        if let Err(e) = lease.release() {
            warn!(task_id = %ctx.task_id(), error = %e, "Failed to release lease");
        }
        result
    }
}
