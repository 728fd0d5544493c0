//! Manual-mode ticket handshake.
//!
//! Creating a manual capture returns an opaque [`Ticket`] immediately. The
//! capture itself runs as a scheduler task; the client redeems the ticket to
//! poll its status, acknowledges each user checkpoint with `next`, and may
//! cancel it at any time before it winds down.

mod capturer;
mod job;
mod request;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info};

use capturerun_core::{
    CaptureRequest, CaptureState, CaptureStatus, NewTask, TaskId, TaskKind, TaskState, Ticket,
};

use crate::scheduler::{Scheduler, SchedulerError};
use crate::workpool::LeasePool;

pub use capturer::{CaptureError, Capturer, SnapshotPhase};

use job::ManualCaptureJob;
use request::ManualRequest;

/// Ticket handshake errors.
#[derive(Debug, Error)]
pub enum ManualModeError {
    #[error("Unknown ticket: {0}")]
    UnknownTicket(Ticket),

    #[error("Request in progress: {0}")]
    RequestInProgress(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

struct TicketEntry {
    task_id: TaskId,
    request: Arc<ManualRequest>,
}

/// Issues tickets for manual captures and serves the handshake on them.
pub struct ManualMode {
    scheduler: Scheduler,
    pool: LeasePool,
    capturer: Arc<dyn Capturer>,
    tickets: RwLock<HashMap<Ticket, TicketEntry>>,
}

impl ManualMode {
    pub fn new(scheduler: Scheduler, pool: LeasePool, capturer: Arc<dyn Capturer>) -> Self {
        Self {
            scheduler,
            pool,
            capturer,
            tickets: RwLock::new(HashMap::new()),
        }
    }

    /// Queue a manual capture and return its ticket.
    pub fn create(
        &self,
        capture: CaptureRequest,
        record_id: Option<i64>,
    ) -> Result<Ticket, ManualModeError> {
        capture
            .validate()
            .map_err(|e| ManualModeError::Validation(e.to_string()))?;
        if !self.pool.has_workpool(&capture.workpool) {
            return Err(ManualModeError::Validation(format!(
                "unknown workpool: {}",
                capture.workpool
            )));
        }

        let ticket = Ticket::generate();
        let request = Arc::new(ManualRequest::new(ticket.clone()));
        let mut task = NewTask::new(TaskKind::ManualModeBuild, capture.display_name.clone());
        if let Some(record_id) = record_id {
            task = task.with_record(record_id);
        }
        let job = ManualCaptureJob {
            request: Arc::clone(&request),
            capture,
            pool: self.pool.clone(),
            capturer: Arc::clone(&self.capturer),
        };

        let task = self.scheduler.add_task(task, job)?;
        request.bind(task.id);

        let mut tickets = self.write();
        self.prune(&mut tickets);
        tickets.insert(
            ticket.clone(),
            TicketEntry {
                task_id: task.id,
                request,
            },
        );
        info!(task_id = %task.id, ticket = %ticket, "Issued manual-mode ticket");
        Ok(ticket)
    }

    /// Current status of the capture behind a ticket.
    pub fn redeem(&self, ticket: &Ticket) -> Result<CaptureStatus, ManualModeError> {
        let (_, request) = self.lookup(ticket)?;
        Ok(request.snapshot())
    }

    /// Acknowledge the checkpoint the capture is parked at.
    ///
    /// `expected` must be a user checkpoint and the capture's current
    /// state; otherwise the request is reported as in progress.
    pub fn next(
        &self,
        ticket: &Ticket,
        expected: CaptureState,
    ) -> Result<CaptureStatus, ManualModeError> {
        let (task, request) = self.lookup(ticket)?;
        let done = expected.done_state().ok_or_else(|| {
            ManualModeError::Validation(format!("{expected:?} is not a user checkpoint"))
        })?;

        let mut outcome = Ok(());
        request.modify(|status| {
            let current = status.current();
            if current != expected {
                outcome = Err(ManualModeError::RequestInProgress(format!(
                    "request is at {current:?}, not {expected:?}"
                )));
                return false;
            }
            status.insert(done)
        });
        outcome?;

        info!(task_id = %task.id, ticket = %ticket, state = ?done, "User checkpoint acknowledged");
        Ok(request.snapshot())
    }

    /// Cancel the capture behind a ticket.
    ///
    /// Accepted until the capture starts winding down; cancelling twice is
    /// harmless. A capture still waiting for a worker or a VM ends
    /// cancelled without running further.
    pub fn cancel(&self, ticket: &Ticket) -> Result<CaptureStatus, ManualModeError> {
        let (task, request) = self.lookup(ticket)?;

        let mut outcome = Ok(());
        let cancelling = request.modify(|status| {
            if status.is_cancelling() {
                return false;
            }
            if status.is_winding_down() {
                outcome = Err(ManualModeError::RequestInProgress(
                    "request is already finishing".to_string(),
                ));
                return false;
            }
            status.insert(CaptureState::Cancelling)
        });
        outcome?;

        if cancelling {
            info!(task_id = %task.id, ticket = %ticket, "Cancelling manual capture");
            if let Some(aborted) = self.scheduler.abort_task(task.id) {
                request.reconcile(&aborted);
            }
        }
        Ok(request.snapshot())
    }

    /// Number of tickets whose task is still retained.
    pub fn ticket_count(&self) -> usize {
        self.read().len()
    }

    /// Resolve a ticket to its live task, forgetting it once the task is gone.
    fn lookup(&self, ticket: &Ticket) -> Result<(TaskState, Arc<ManualRequest>), ManualModeError> {
        let (task_id, request) = {
            let tickets = self.read();
            let entry = tickets
                .get(ticket)
                .ok_or_else(|| ManualModeError::UnknownTicket(ticket.clone()))?;
            (entry.task_id, Arc::clone(&entry.request))
        };

        match self.scheduler.find_task_by_id(task_id) {
            Some(task) => {
                request.reconcile(&task);
                Ok((task, request))
            }
            None => {
                debug!(task_id = %task_id, ticket = %ticket, "Ticket task was evicted");
                self.write().remove(ticket);
                Err(ManualModeError::UnknownTicket(ticket.clone()))
            }
        }
    }

    fn prune(&self, tickets: &mut HashMap<Ticket, TicketEntry>) {
        tickets.retain(|_, entry| self.scheduler.find_task_by_id(entry.task_id).is_some());
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Ticket, TicketEntry>> {
        match self.tickets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Ticket, TicketEntry>> {
        match self.tickets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
