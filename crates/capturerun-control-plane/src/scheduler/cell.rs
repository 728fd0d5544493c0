//! Live container for one task's envelope.

use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;

use capturerun_core::{
    now_ms, CoreError, MetaStatus, PerformanceSample, TaskEvent, TaskId, TaskKind, TaskState,
    TaskStatus, TaskUpdate,
};

use crate::events::EventBus;
use crate::stall::{StallConfig, StallDetector};

/// Holds the current snapshot of a task and everything its worker shares
/// with the scheduler.
///
/// Updates swap the whole snapshot under the write lock and publish the
/// resulting event before releasing it, so readers see complete snapshots
/// and subscribers see updates in the order they were applied.
pub(crate) struct TaskCell {
    id: TaskId,
    kind: TaskKind,
    state: RwLock<Arc<TaskState>>,
    token: CancellationToken,
    stall: Mutex<Option<StallDetector>>,
    events: Arc<EventBus>,
}

impl TaskCell {
    pub fn new(state: TaskState, events: Arc<EventBus>) -> Self {
        Self {
            id: state.id,
            kind: state.kind,
            state: RwLock::new(Arc::new(state)),
            token: CancellationToken::new(),
            stall: Mutex::new(None),
            events,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn snapshot(&self) -> Arc<TaskState> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn meta(&self) -> MetaStatus {
        self.snapshot().meta()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Apply an update built on top of the current snapshot.
    ///
    /// Fires an `Updated` event when at least one field changed.
    pub fn update<F>(&self, build: F) -> Result<Arc<TaskState>, CoreError>
    where
        F: FnOnce(TaskUpdate<'_>) -> TaskUpdate<'_>,
    {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (next, changed) = build(guard.update()).apply()?;
        if changed.is_empty() {
            return Ok(Arc::clone(&guard));
        }

        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        self.events.publish(TaskEvent::Updated {
            task: (*next).clone(),
            changed,
        });
        Ok(next)
    }

    /// Move the task to its running status.
    pub fn start(&self, stall: StallConfig) -> Result<Arc<TaskState>, CoreError> {
        let kind = self.kind;
        let started = self.update(|u| u.status(TaskStatus::started(kind)).started(now_ms()))?;
        if kind == TaskKind::Conversion {
            *self.detector() = Some(StallDetector::new(stall));
        }
        Ok(started)
    }

    fn detector(&self) -> std::sync::MutexGuard<'_, Option<StallDetector>> {
        match self.stall.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Feed a performance sample; returns whether the task is now stalled.
    pub fn record_sample(&self, sample: &PerformanceSample) -> bool {
        let stalled = {
            let mut detector = self.detector();
            match detector.as_mut() {
                Some(detector) => {
                    detector.add_sample(sample);
                    detector.is_stalled()
                }
                None => return false,
            }
        };

        if stalled != self.snapshot().stalled {
            // A task that just reached a terminal status keeps its flag
            let _ = self.update(|u| u.stalled(stalled));
        }
        stalled
    }

    /// Clear the stall window; returns false if the task has none.
    pub fn unstall(&self) -> bool {
        {
            let mut detector = self.detector();
            match detector.as_mut() {
                Some(detector) => detector.unstall(),
                None => return false,
            }
        }
        let _ = self.update(|u| u.stalled(false));
        true
    }

    /// Discard the stall window once the task stops running.
    pub fn drop_detector(&self) {
        self.detector().take();
    }
}
