//! The manual capture job.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use capturerun_core::{CaptureRequest, CaptureState, Lease};

use super::capturer::{CaptureError, Capturer, SnapshotPhase};
use super::request::{task_status, ManualRequest};
use crate::scheduler::{Job, JobContext, JobError};
use crate::workpool::LeasePool;

/// Drives one capture through its phases, pausing at each user checkpoint
/// until the ticket holder acknowledges it.
pub(crate) struct ManualCaptureJob {
    pub request: Arc<ManualRequest>,
    pub capture: CaptureRequest,
    pub pool: LeasePool,
    pub capturer: Arc<dyn Capturer>,
}

#[async_trait]
impl Job for ManualCaptureJob {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        self.enter(&ctx, CaptureState::AcquiringVm)?;
        let lease = tokio::select! {
            _ = ctx.cancelled() => Err(JobError::Cancelled),
            lease = self.pool.lease(&self.capture.workpool) => lease.map_err(JobError::from),
        };

        let result = match lease {
            Ok(lease) => {
                let result = self.drive(&ctx, &lease).await;
                if let Err(e) = lease.release() {
                    warn!(task_id = %ctx.task_id(), error = %e, "Failed to release lease");
                }
                self.request.modify(|status| {
                    status.vm = None;
                    status.insert(CaptureState::VmReleased);
                    true
                });
                result
            }
            Err(e) => Err(e),
        };

        self.settle(&ctx, &result);
        result
    }
}

impl ManualCaptureJob {
    async fn drive(&self, ctx: &JobContext, lease: &Lease) -> Result<(), JobError> {
        self.request.modify(|status| {
            status.vm = Some(lease.instance_name.clone());
            true
        });
        self.enter(ctx, CaptureState::VmAcquired)?;
        info!(
            task_id = %ctx.task_id(),
            vm = %lease.instance_name,
            "Manual capture acquired VM"
        );

        self.step(ctx, CaptureState::PoweringOnVm, self.capturer.power_on(lease))
            .await?;
        self.step(ctx, CaptureState::WaitingForTools, self.capturer.wait_for_tools(lease))
            .await?;

        if !self.capture.autologon {
            self.wait_for_user(ctx, CaptureState::NeedsLoginWait).await?;
        }
        self.wait_for_user(ctx, CaptureState::PreCaptureWait).await?;
        self.step(
            ctx,
            CaptureState::TakingPreCaptureSnapshot,
            self.capturer.take_snapshot(lease, SnapshotPhase::PreCapture),
        )
        .await?;

        self.wait_for_user(ctx, CaptureState::InstallationWait).await?;
        self.step(
            ctx,
            CaptureState::TakingPostCaptureSnapshot,
            self.capturer.take_snapshot(lease, SnapshotPhase::PostCapture),
        )
        .await?;

        let project_id = self
            .step(
                ctx,
                CaptureState::GeneratingProject,
                self.capturer.generate_project(lease, &self.capture),
            )
            .await?;
        self.request.modify(|status| {
            status.project_id = Some(project_id);
            true
        });

        self.step(
            ctx,
            CaptureState::BuildingProject,
            self.capturer.build_project(lease, project_id),
        )
        .await
    }

    /// Enter `state` and run its operation, giving up on cancellation.
    async fn step<T, F>(&self, ctx: &JobContext, state: CaptureState, operation: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, CaptureError>> + Send,
    {
        ctx.check_cancelled()?;
        self.enter(ctx, state)?;
        tokio::select! {
            _ = ctx.cancelled() => Err(JobError::Cancelled),
            result = operation => result.map_err(JobError::from),
        }
    }

    /// Park at a checkpoint until the client acknowledges it.
    async fn wait_for_user(&self, ctx: &JobContext, checkpoint: CaptureState) -> Result<(), JobError> {
        let Some(done) = checkpoint.done_state() else {
            return Ok(());
        };
        ctx.check_cancelled()?;
        self.enter(ctx, checkpoint)?;
        info!(task_id = %ctx.task_id(), state = ?checkpoint, "Waiting for user");

        let mut status = self.request.subscribe();
        loop {
            let acknowledged = status.borrow_and_update().contains(done);
            if acknowledged {
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(JobError::Cancelled),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(JobError::Cancelled);
                    }
                }
            }
        }
    }

    /// Mirror `state` onto the task, then publish it to the ticket holder.
    fn enter(&self, ctx: &JobContext, state: CaptureState) -> Result<(), JobError> {
        let progress = self.request.current().max(state).percent();
        ctx.update_status_with_progress(task_status(state), progress)?;
        self.request.enter(state);
        Ok(())
    }

    /// Record how the capture ended.
    fn settle(&self, ctx: &JobContext, result: &Result<(), JobError>) {
        let cancelled = ctx.is_cancelled();
        self.request.modify(|status| {
            let outcome = match result {
                _ if cancelled => CaptureState::Cancelled,
                Ok(()) => CaptureState::Success,
                Err(e) => {
                    status.last_error = Some(e.to_string());
                    CaptureState::Failure
                }
            };
            status.insert(outcome);
            status.insert(CaptureState::Finished);
            true
        });

        match result {
            _ if cancelled => info!(task_id = %ctx.task_id(), "Manual capture cancelled"),
            Ok(()) => info!(task_id = %ctx.task_id(), "Manual capture succeeded"),
            Err(e) => warn!(task_id = %ctx.task_id(), error = %e, "Manual capture failed"),
        }
    }
}
