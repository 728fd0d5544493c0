//! Bounded-concurrency task scheduler.
//!
//! Tasks enter a FIFO wait queue, at most `max_running` of them execute at a
//! time, and finished tasks are retained in a bounded ring until evicted.
//! Both limits are read from a `watch` channel at every admission and
//! eviction decision, so they can be tuned while the scheduler runs.
//!
//! Queue bookkeeping lives behind one mutex that is only held for short,
//! non-async sections. Each task's envelope lives in its own [`TaskCell`];
//! the lock order is always queue, then cell.

mod cell;
mod job;
mod view;
mod wait_queue;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use capturerun_core::{
    now_ms, CoreError, MetaStatus, NewTask, TaskEvent, TaskId, TaskKind, TaskState, TaskStatus,
};

use crate::config::{Config, QueueLimits};
use crate::events::EventBus;
use crate::stall::StallConfig;

use cell::TaskCell;
use wait_queue::WaitQueue;

pub use job::{Job, JobContext, JobError};
pub use view::{TaskFilter, TaskView};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Core(#[from] CoreError),
}

struct Entry {
    cell: Arc<TaskCell>,
    /// Taken when a worker starts the task.
    job: Option<Arc<dyn Job>>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Entry>,
    waiting: WaitQueue,
    running: HashSet<TaskId>,
    /// Oldest first.
    finished: VecDeque<TaskId>,
    closed: bool,
}

struct Inner {
    name: String,
    state: Mutex<QueueState>,
    events: Arc<EventBus>,
    limits: watch::Receiver<QueueLimits>,
    stall: StallConfig,
    abort_grace: Duration,
    wake: Notify,
    /// Number of waiting plus running tasks.
    active: watch::Sender<usize>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

/// Task scheduler.
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create the scheduler and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &Config,
        events: Arc<EventBus>,
        limits: watch::Receiver<QueueLimits>,
    ) -> Self {
        let (active, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            name: config.queue_name.clone(),
            state: Mutex::new(QueueState::default()),
            events,
            limits,
            stall: config.stall,
            abort_grace: config.abort_grace,
            wake: Notify::new(),
            active,
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(dispatch(Arc::clone(&inner)));
        info!("{} queue: started", inner.name);
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current limits.
    pub fn limits(&self) -> QueueLimits {
        *self.inner.limits.borrow()
    }

    /// Queue a task behind every task already waiting.
    ///
    /// Never blocks; the task starts once a worker slot frees up.
    pub fn add_task(&self, task: NewTask, job: impl Job) -> Result<TaskState, SchedulerError> {
        self.add_shared(task, Arc::new(job))
    }

    /// Same as [`Scheduler::add_task`] for an already shared job.
    pub fn add_shared(&self, task: NewTask, job: Arc<dyn Job>) -> Result<TaskState, SchedulerError> {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.closed {
            return Err(SchedulerError::ShuttingDown);
        }

        let id = TaskId::new(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let initial = TaskState::new(id, &task);
        let (waiting, _) = initial
            .update()
            .status(TaskStatus::queued(task.kind))
            .queued(now_ms())
            .apply()?;

        let cell = Arc::new(TaskCell::new(waiting.clone(), Arc::clone(&inner.events)));
        state.tasks.insert(
            id,
            Entry {
                cell,
                job: Some(job),
            },
        );
        state.waiting.push_back(id);
        inner.events.publish(TaskEvent::Added {
            task: waiting.clone(),
        });
        inner.publish_active(&state);
        drop(state);

        info!(
            task_id = %id,
            kind = %task.kind,
            "{} queue: added task '{}'",
            inner.name,
            task.description
        );
        inner.wake.notify_one();
        Ok(waiting)
    }

    /// Look a task up in any state.
    pub fn find_task_by_id(&self, id: TaskId) -> Option<TaskState> {
        let state = self.inner.lock();
        state
            .tasks
            .get(&id)
            .map(|entry| (*entry.cell.snapshot()).clone())
    }

    /// Snapshot of the tasks matching `filter`, in [`Scheduler::get_all_tasks`] order.
    pub fn get_tasks(&self, filter: TaskFilter) -> TaskView {
        self.get_tasks_where(|task| filter.matches(task))
    }

    /// Snapshot of the tasks matching an arbitrary predicate.
    pub fn get_tasks_where<P>(&self, predicate: P) -> TaskView
    where
        P: Fn(&TaskState) -> bool,
    {
        let state = self.inner.lock();
        let snapshot = |id: &TaskId| state.tasks.get(id).map(|entry| entry.cell.snapshot());

        let mut finished: Vec<_> = state.finished.iter().filter_map(snapshot).collect();
        finished.sort_by_key(|task| task.id);
        let mut running: Vec<_> = state.running.iter().filter_map(snapshot).collect();
        running.sort_by_key(|task| task.id);
        let waiting = state.waiting.iter().filter_map(|id| snapshot(&id));

        let tasks = finished
            .into_iter()
            .chain(running)
            .chain(waiting)
            .filter(|task| predicate(task.as_ref()))
            .collect();
        TaskView::new(tasks)
    }

    /// Finished tasks first, then running, then waiting in queue order.
    pub fn get_all_tasks(&self) -> TaskView {
        self.get_tasks(TaskFilter::All)
    }

    /// Waiting or running tasks owned by `record_id`.
    pub fn find_active_tasks_for_record(&self, record_id: i64) -> Vec<TaskState> {
        self.get_tasks_where(|task| {
            task.record_id == Some(record_id) && task.meta() != MetaStatus::Finished
        })
        .to_vec()
    }

    /// Number of waiting or running tasks owned by `record_id`.
    pub fn count_active_tasks_for_record(&self, record_id: i64) -> usize {
        self.find_active_tasks_for_record(record_id).len()
    }

    pub fn move_to_head(&self, id: TaskId) -> bool {
        let mut state = self.inner.lock();
        if !state.waiting.move_to_head(id) {
            return false;
        }
        if let Some(task) = state.snapshot(id) {
            debug!(task_id = %id, "{} queue: moved to head", self.inner.name);
            self.inner.events.publish(TaskEvent::MovedToHead { task });
        }
        true
    }

    pub fn move_to_tail(&self, id: TaskId) -> bool {
        let mut state = self.inner.lock();
        if !state.waiting.move_to_tail(id) {
            return false;
        }
        if let Some(task) = state.snapshot(id) {
            debug!(task_id = %id, "{} queue: moved to tail", self.inner.name);
            self.inner.events.publish(TaskEvent::MovedToTail { task });
        }
        true
    }

    /// Place waiting task `id` directly after waiting task `other`.
    pub fn move_after(&self, id: TaskId, other: TaskId) -> bool {
        let mut state = self.inner.lock();
        if !state.waiting.move_after(id, other) {
            return false;
        }
        if let Some(task) = state.snapshot(id) {
            debug!(task_id = %id, after = %other, "{} queue: moved", self.inner.name);
            self.inner
                .events
                .publish(TaskEvent::MovedAfter { task, after: other });
        }
        true
    }

    /// Place waiting task `id` directly before waiting task `other`.
    pub fn move_before(&self, id: TaskId, other: TaskId) -> bool {
        let mut state = self.inner.lock();
        let Some(predecessor) = state.waiting.move_before(id, other) else {
            return false;
        };
        if let Some(task) = state.snapshot(id) {
            debug!(task_id = %id, before = %other, "{} queue: moved", self.inner.name);
            let event = match predecessor {
                Some(after) => TaskEvent::MovedAfter { task, after },
                None => TaskEvent::MovedToHead { task },
            };
            self.inner.events.publish(event);
        }
        true
    }

    /// Abort a task.
    ///
    /// A waiting task finishes immediately without running; a running task
    /// is asked to cancel and finishes once its worker returns. Finished
    /// tasks are left untouched. Returns the task's snapshot, or `None` if
    /// the id is unknown.
    pub fn abort_task(&self, id: TaskId) -> Option<TaskState> {
        let inner = &self.inner;
        let mut state = inner.lock();
        let Some(entry) = state.tasks.get_mut(&id) else {
            warn!(task_id = %id, "{} queue: abort of unknown task", inner.name);
            return None;
        };
        let cell = Arc::clone(&entry.cell);

        match cell.meta() {
            MetaStatus::Init | MetaStatus::Waiting => {
                entry.job = None;
                state.waiting.remove(id);
                let kind = cell.kind();
                if let Err(e) = cell.update(|u| {
                    u.status(TaskStatus::cancelled(kind))
                        .aborted(true)
                        .progress(-1)
                }) {
                    warn!(task_id = %id, error = %e, "{} queue: failed to abort", inner.name);
                }
                state.finished.push_back(id);
                inner.evict_finished(&mut state);
                inner.publish_active(&state);
                info!(task_id = %id, "{} queue: aborted waiting task", inner.name);
            }
            MetaStatus::Running => {
                if !cell.token().is_cancelled() {
                    if let Err(e) = cell.update(|u| u.aborted(true)) {
                        warn!(task_id = %id, error = %e, "{} queue: failed to mark aborted", inner.name);
                    }
                    cell.token().cancel();
                    info!(task_id = %id, "{} queue: cancelling running task", inner.name);
                }
            }
            MetaStatus::Finished => {
                debug!(task_id = %id, "{} queue: abort of finished task ignored", inner.name);
            }
        }

        Some((*cell.snapshot()).clone())
    }

    /// Abort every unfinished task, waiting ones first.
    ///
    /// Returns the number of tasks aborted.
    pub fn abort_all_tasks(&self) -> usize {
        let (waiting, mut running) = {
            let state = self.inner.lock();
            let waiting: Vec<TaskId> = state.waiting.iter().collect();
            let running: Vec<TaskId> = state.running.iter().copied().collect();
            (waiting, running)
        };
        running.sort();

        info!(
            waiting = waiting.len(),
            running = running.len(),
            "{} queue: aborting all tasks",
            self.inner.name
        );
        let mut aborted = 0;
        for id in waiting.into_iter().chain(running) {
            if self.abort_task(id).is_some() {
                aborted += 1;
            }
        }
        aborted
    }

    /// Evict every finished task. Returns the evicted snapshots.
    pub fn cleanup(&self) -> Vec<TaskState> {
        let mut state = self.inner.lock();
        let ids: Vec<TaskId> = state.finished.drain(..).collect();
        ids.into_iter()
            .filter_map(|id| self.inner.remove_entry(&mut state, id))
            .collect()
    }

    /// Evict one finished task; false if it is unknown or not finished.
    pub fn cleanup_task(&self, id: TaskId) -> bool {
        let mut state = self.inner.lock();
        let Some(pos) = state.finished.iter().position(|finished| *finished == id) else {
            return false;
        };
        state.finished.remove(pos);
        self.inner.remove_entry(&mut state, id).is_some()
    }

    /// Clear the stall window of a running conversion task.
    pub fn unstall(&self, id: TaskId) -> Option<TaskState> {
        let cell = {
            let state = self.inner.lock();
            let entry = state.tasks.get(&id)?;
            Arc::clone(&entry.cell)
        };
        if cell.kind() != TaskKind::Conversion || !cell.unstall() {
            return None;
        }
        info!(task_id = %id, "{} queue: unstalled", self.inner.name);
        Some((*cell.snapshot()).clone())
    }

    /// Stop accepting tasks.
    ///
    /// With `wait_for_completion`, queued tasks keep being admitted and the
    /// call returns once nothing is waiting or running. Otherwise every
    /// unfinished task is aborted before returning; running jobs wind down
    /// in the background (see [`Scheduler::wait_until_idle`]).
    pub async fn graceful_shutdown(&self, wait_for_completion: bool) {
        {
            let mut state = self.inner.lock();
            state.closed = true;
        }
        info!(
            wait_for_completion,
            "{} queue: shutting down", self.inner.name
        );

        if wait_for_completion {
            self.wait_until_idle().await;
        } else {
            self.abort_all_tasks();
        }
        self.inner.shutdown.cancel();
    }

    /// Resolves once no task is waiting or running.
    pub async fn wait_until_idle(&self) {
        let mut active = self.inner.active.subscribe();
        loop {
            let idle = *active.borrow_and_update() == 0;
            if idle || active.changed().await.is_err() {
                break;
            }
        }
    }

    /// Number of waiting plus running tasks.
    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }
}

impl QueueState {
    fn snapshot(&self, id: TaskId) -> Option<TaskState> {
        self.tasks
            .get(&id)
            .map(|entry| (*entry.cell.snapshot()).clone())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_active(&self, state: &QueueState) {
        self.active
            .send_replace(state.waiting.len() + state.running.len());
    }

    fn remove_entry(&self, state: &mut QueueState, id: TaskId) -> Option<TaskState> {
        let entry = state.tasks.remove(&id)?;
        let task = (*entry.cell.snapshot()).clone();
        debug!(task_id = %id, "{} queue: removed finished task", self.name);
        self.events.publish(TaskEvent::Removed { task: task.clone() });
        Some(task)
    }

    fn evict_finished(&self, state: &mut QueueState) {
        let cap = self.limits.borrow().finished();
        while state.finished.len() > cap {
            let Some(id) = state.finished.pop_front() else {
                break;
            };
            self.remove_entry(state, id);
        }
    }

    /// Start waiting tasks while worker slots are free.
    fn admit(self: &Arc<Self>) {
        let max_running = self.limits.borrow().running();
        let mut started = Vec::new();
        {
            let mut state = self.lock();
            while state.running.len() < max_running {
                let Some(id) = state.waiting.pop_front() else {
                    break;
                };
                let Some(entry) = state.tasks.get_mut(&id) else {
                    continue;
                };
                let Some(job) = entry.job.take() else {
                    continue;
                };
                let cell = Arc::clone(&entry.cell);
                if let Err(e) = cell.start(self.stall) {
                    warn!(task_id = %id, error = %e, "{} queue: cannot start task", self.name);
                    continue;
                }
                state.running.insert(id);
                started.push((cell, job));
            }
            self.publish_active(&state);
        }

        for (cell, job) in started {
            info!(task_id = %cell.id(), "{} queue: running task", self.name);
            tokio::spawn(run_worker(Arc::clone(self), cell, job));
        }
    }

    /// Record a worker's outcome and free its slot.
    fn finish(&self, cell: &TaskCell, joined: Result<Result<(), JobError>, JoinError>) {
        let id = cell.id();
        let kind = cell.kind();
        cell.drop_detector();

        let mut state = self.lock();
        let applied = if cell.token().is_cancelled() {
            info!(task_id = %id, "{} queue: task aborted", self.name);
            cell.update(|u| {
                u.status(TaskStatus::cancelled(kind))
                    .aborted(true)
                    .progress(-1)
            })
        } else {
            match joined {
                Ok(Ok(())) => {
                    info!(task_id = %id, "{} queue: task complete", self.name);
                    cell.update(|u| u.status(TaskStatus::completed(kind)).progress(100))
                }
                Ok(Err(e)) => {
                    error!(task_id = %id, error = %e, "{} queue: task failed", self.name);
                    let message = e.to_string();
                    cell.update(|u| u.status(TaskStatus::failed(kind)).last_error(message))
                }
                Err(e) => {
                    error!(task_id = %id, error = %e, "{} queue: task panicked", self.name);
                    let message = format!("job panicked: {e}");
                    cell.update(|u| u.status(TaskStatus::failed(kind)).last_error(message))
                }
            }
        };
        if let Err(e) = applied {
            warn!(task_id = %id, error = %e, "{} queue: could not record outcome", self.name);
        }

        state.running.remove(&id);
        state.finished.push_back(id);
        self.evict_finished(&mut state);
        self.publish_active(&state);
        drop(state);

        self.wake.notify_one();
    }
}

/// Admits tasks whenever something may have freed a slot or queued work.
async fn dispatch(inner: Arc<Inner>) {
    let mut limits = inner.limits.clone();
    let mut limits_open = true;

    loop {
        inner.admit();

        tokio::select! {
            _ = inner.wake.notified() => {}
            changed = limits.changed(), if limits_open => {
                if changed.is_ok() {
                    let current = *limits.borrow_and_update();
                    info!(
                        max_running = current.max_running,
                        max_finished = current.max_finished,
                        "{} queue: limits changed",
                        inner.name
                    );
                    inner.evict_finished(&mut inner.lock());
                } else {
                    limits_open = false;
                }
            }
            _ = inner.shutdown.cancelled() => break,
        }
    }

    debug!("{} queue: dispatcher stopped", inner.name);
}

/// Drive one job to completion, enforcing the abort grace period.
async fn run_worker(inner: Arc<Inner>, cell: Arc<TaskCell>, job: Arc<dyn Job>) {
    let ctx = JobContext::new(Arc::clone(&cell));
    let token = cell.token().clone();
    let mut handle = tokio::spawn(async move { job.run(ctx).await });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = token.cancelled() => {
            match tokio::time::timeout(inner.abort_grace, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        task_id = %cell.id(),
                        "{} queue: job ignored cancellation, aborting it",
                        inner.name
                    );
                    handle.abort();
                    handle.await
                }
            }
        }
    };

    inner.finish(&cell, joined);
}

#[cfg(test)]
mod tests;
