//! Shared application state.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use capturerun_core::{CaptureRequest, TaskState};

use crate::config::{Config, QueueLimits};
use crate::conversion::{conversion_task, ConversionBackend, ConversionError, ConversionJob};
use crate::events::EventBus;
use crate::manual::{Capturer, ManualMode};
use crate::scheduler::Scheduler;
use crate::workpool::{LeasePool, Provisioner};

/// Shared application state.
pub struct AppState {
    /// Configuration the services were built from.
    pub config: Config,

    /// Task queue shared by conversion and manual-mode jobs.
    pub scheduler: Scheduler,

    /// Workpools and their leases.
    pub pool: LeasePool,

    /// Manual-mode ticket handshake.
    pub manual: ManualMode,

    /// Scheduler event fan-out.
    pub events: Arc<EventBus>,

    /// Live queue limits; the scheduler re-reads them at every decision.
    pub limits: watch::Sender<QueueLimits>,

    /// Backend automatic conversions are handed to.
    pub backend: Arc<dyn ConversionBackend>,
}

impl AppState {
    /// Build every service and start the scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        provisioner: Arc<dyn Provisioner>,
        capturer: Arc<dyn Capturer>,
        backend: Arc<dyn ConversionBackend>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let (limits, limits_rx) = watch::channel(config.limits);
        let scheduler = Scheduler::start(&config, Arc::clone(&events), limits_rx);
        let pool = LeasePool::new(provisioner, config.lease_wait_timeout);
        let manual = ManualMode::new(scheduler.clone(), pool.clone(), capturer);

        Arc::new(Self {
            config,
            scheduler,
            pool,
            manual,
            events,
            limits,
            backend,
        })
    }

    /// Queue an automatic conversion.
    pub fn submit_conversion(
        &self,
        request: CaptureRequest,
        record_id: Option<i64>,
    ) -> Result<TaskState, ConversionError> {
        request
            .validate()
            .map_err(|e| ConversionError::Validation(e.to_string()))?;
        if !self.pool.has_workpool(&request.workpool) {
            return Err(ConversionError::Validation(format!(
                "unknown workpool: {}",
                request.workpool
            )));
        }

        let task = conversion_task(&request, record_id);
        let job = ConversionJob::new(
            request,
            self.pool.clone(),
            Arc::clone(&self.backend),
            self.config.poll_interval,
        );
        Ok(self.scheduler.add_task(task, job)?)
    }

    /// Replace the queue limits.
    pub fn set_limits(&self, limits: QueueLimits) {
        let previous = self.limits.send_replace(limits);
        info!(
            max_running = limits.max_running,
            max_finished = limits.max_finished,
            previous_running = previous.max_running,
            previous_finished = previous.max_finished,
            "Queue limits updated"
        );
    }

    /// Stop the scheduler, then close the event stream.
    ///
    /// Unfinished tasks are aborted; running jobs get up to `grace` to wind
    /// down.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.scheduler.graceful_shutdown(false).await;
        if tokio::time::timeout(grace, self.scheduler.wait_until_idle())
            .await
            .is_err()
        {
            warn!(
                active = self.scheduler.active_count(),
                "Tasks still running at shutdown"
            );
        }
        self.events.shutdown();
    }
}
