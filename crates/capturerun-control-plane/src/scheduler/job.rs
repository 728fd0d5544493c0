//! Job trait and the context a running job sees.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use capturerun_core::{CoreError, PerformanceSample, TaskId, TaskKind, TaskState, TaskStatus};

use super::cell::TaskCell;
use crate::workpool::LeaseError;

/// Errors a job can end with.
///
/// Any error returned from [`Job::run`] is recorded as the task's failed
/// status; it never escapes the worker.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job cancelled")]
    Cancelled,

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Conversion backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Unit of work executed by a scheduler worker.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Run to completion.
    ///
    /// Return `Ok` on success. Cancellation is observed through
    /// [`JobContext::cancelled`]; a cancelled job should return promptly,
    /// with any result.
    async fn run(&self, ctx: JobContext) -> Result<(), JobError>;
}

/// Handle a running job uses to report progress and observe cancellation.
#[derive(Clone)]
pub struct JobContext {
    cell: Arc<TaskCell>,
}

impl JobContext {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self { cell }
    }

    pub fn task_id(&self) -> TaskId {
        self.cell.id()
    }

    pub fn kind(&self) -> TaskKind {
        self.cell.kind()
    }

    /// Current snapshot of the task.
    pub fn snapshot(&self) -> TaskState {
        (*self.cell.snapshot()).clone()
    }

    /// Set a non-terminal status.
    ///
    /// Terminal statuses are applied by the worker from the job's result.
    pub fn update_status(&self, status: impl Into<TaskStatus>) -> Result<(), JobError> {
        let status = self.running_status(status.into())?;
        self.cell.update(|u| u.status(status))?;
        Ok(())
    }

    pub fn update_status_with_progress(
        &self,
        status: impl Into<TaskStatus>,
        progress: i32,
    ) -> Result<(), JobError> {
        let status = self.running_status(status.into())?;
        self.cell.update(|u| u.status(status).progress(progress))?;
        Ok(())
    }

    pub fn update_progress(&self, progress: i32) -> Result<(), JobError> {
        self.cell.update(|u| u.progress(progress))?;
        Ok(())
    }

    pub fn increment_progress_by(&self, delta: i32) -> Result<(), JobError> {
        self.cell.update(|u| u.increment_progress(delta))?;
        Ok(())
    }

    fn running_status(&self, status: TaskStatus) -> Result<TaskStatus, CoreError> {
        if status.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.cell.snapshot().status.to_string(),
                to: status.to_string(),
            });
        }
        Ok(status)
    }

    /// Feed a performance sample to the stall detector.
    ///
    /// Returns whether the task is currently considered stalled. Tasks
    /// without stall detection always report false.
    pub fn record_performance(&self, sample: &PerformanceSample) -> bool {
        self.cell.record_sample(sample)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.token().is_cancelled()
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cell.token().cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cell.token().clone()
    }
}
