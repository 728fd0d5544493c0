//! Shared, atomically updated status of one manual capture.

use tokio::sync::watch;

use capturerun_core::{
    CaptureState, CaptureStatus, ManualModeStatus, TaskId, TaskState, TaskStatus, Ticket,
};

/// Status cell shared by the ticket service and the capture job.
///
/// Every modification swaps the whole [`CaptureStatus`] inside a watch
/// channel, so readers always see a coherent snapshot and the job can wait
/// for the client's acknowledgement.
pub(crate) struct ManualRequest {
    status: watch::Sender<CaptureStatus>,
}

impl ManualRequest {
    pub fn new(ticket: Ticket) -> Self {
        let (status, _) = watch::channel(CaptureStatus::new(ticket, TaskId::new(0)));
        Self { status }
    }

    /// Record the task the request runs as.
    pub fn bind(&self, task_id: TaskId) {
        self.status.send_modify(|status| status.task_id = task_id);
    }

    pub fn snapshot(&self) -> CaptureStatus {
        self.status.borrow().clone()
    }

    pub fn current(&self) -> CaptureState {
        self.status.borrow().current()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureStatus> {
        self.status.subscribe()
    }

    /// Apply `modify`; watchers are woken only if it returns true.
    pub fn modify<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut CaptureStatus) -> bool,
    {
        self.status.send_if_modified(modify)
    }

    /// Record a reached state; returns false if it was already reached.
    pub fn enter(&self, state: CaptureState) -> bool {
        self.modify(|status| status.insert(state))
    }

    /// Settle the capture from its task's terminal status.
    ///
    /// Covers tasks that finished without the job settling the capture
    /// itself: aborted before they started, or forced down after ignoring
    /// cancellation.
    pub fn reconcile(&self, task: &TaskState) {
        if !task.is_terminal() {
            return;
        }
        self.modify(|status| {
            if status.is_finished() {
                return false;
            }
            let outcome = match task.status {
                TaskStatus::ManualMode(ManualModeStatus::Complete) => CaptureState::Success,
                TaskStatus::ManualMode(ManualModeStatus::Failed) => CaptureState::Failure,
                _ => CaptureState::Cancelled,
            };
            if outcome == CaptureState::Failure && status.last_error.is_none() {
                status.last_error = task.last_error.clone();
            }
            status.insert(outcome);
            status.insert(CaptureState::Finished);
            true
        });
    }
}

/// Task status mirroring a capture state.
pub(crate) fn task_status(state: CaptureState) -> ManualModeStatus {
    match state {
        CaptureState::AcquiringVm => ManualModeStatus::AcquiringVm,
        CaptureState::Created
        | CaptureState::VmAcquired
        | CaptureState::PoweringOnVm
        | CaptureState::WaitingForTools => ManualModeStatus::Starting,
        CaptureState::NeedsLoginWait
        | CaptureState::PreCaptureWait
        | CaptureState::InstallationWait => ManualModeStatus::WaitingForUser,
        _ => ManualModeStatus::Building,
    }
}
