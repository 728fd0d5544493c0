//! Task envelope and its update builder.

use serde::{Deserialize, Serialize};

use crate::{now_ms, CoreError, MetaStatus, TaskId, TaskKind, TaskStatus};

/// Lowest progress value; means indeterminate, or aborted once finished.
pub const PROGRESS_INDETERMINATE: i32 = -1;

/// Highest progress value.
pub const PROGRESS_COMPLETE: i32 = 100;

/// Description of a task to be submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub kind: TaskKind,
    pub description: String,
    pub record_id: Option<i64>,
}

impl NewTask {
    pub fn new(kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            record_id: None,
        }
    }

    /// Builder method to set the owning record.
    pub fn with_record(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }
}

/// Snapshot of a task's envelope.
///
/// Instances are immutable once published; changes go through
/// [`TaskState::update`], which produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// Unique task identifier.
    pub id: TaskId,

    /// Kind of work, doubles as the wire type tag.
    #[serde(rename = "type")]
    pub kind: TaskKind,

    /// Human readable description.
    pub description: String,

    /// Detailed, kind-specific status.
    pub status: TaskStatus,

    /// 0..=100, or -1 when indeterminate or aborted.
    pub progress: i32,

    /// When the task entered the wait queue (ms, 0 = not yet).
    pub queued: i64,

    /// When a worker picked the task up (ms, 0 = not yet).
    pub started: i64,

    /// When the task reached a terminal status (ms, 0 = not yet).
    pub finished: i64,

    /// Whether the task was aborted.
    pub aborted: bool,

    /// Record that owns this task, if any.
    pub record_id: Option<i64>,

    /// Whether the stall detector currently flags the task.
    pub stalled: bool,

    /// Failure message once the task failed.
    pub last_error: Option<String>,
}

impl TaskState {
    /// Create a task in its initial status.
    pub fn new(id: TaskId, task: &NewTask) -> Self {
        Self {
            id,
            kind: task.kind,
            description: task.description.clone(),
            status: TaskStatus::initial(task.kind),
            progress: PROGRESS_INDETERMINATE,
            queued: 0,
            started: 0,
            finished: 0,
            aborted: false,
            record_id: task.record_id,
            stalled: false,
            last_error: None,
        }
    }

    pub fn meta(&self) -> MetaStatus {
        self.status.meta()
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Start building a new snapshot derived from this one.
    pub fn update(&self) -> TaskUpdate<'_> {
        TaskUpdate {
            base: self,
            next: self.clone(),
        }
    }
}

/// Individual envelope field, used to describe what an update changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    Description,
    Status,
    Progress,
    Queued,
    Started,
    Finished,
    Aborted,
    Stalled,
    LastError,
}

/// Builder producing the next snapshot of a task.
///
/// Nothing is observable until [`TaskUpdate::apply`] returns the new
/// snapshot, so a half-built update can simply be dropped.
#[derive(Debug)]
#[must_use = "an update does nothing until applied"]
pub struct TaskUpdate<'a> {
    base: &'a TaskState,
    next: TaskState,
}

impl TaskUpdate<'_> {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.next.description = description.into();
        self
    }

    pub fn status(mut self, status: impl Into<TaskStatus>) -> Self {
        self.next.status = status.into();
        self
    }

    /// Set progress, clamped to `-1..=100`.
    pub fn progress(mut self, progress: i32) -> Self {
        self.next.progress = progress.clamp(PROGRESS_INDETERMINATE, PROGRESS_COMPLETE);
        self
    }

    /// Add to the current progress, clamped to `-1..=100`.
    pub fn increment_progress(self, delta: i32) -> Self {
        let current = self.next.progress.max(0);
        self.progress(current.saturating_add(delta))
    }

    pub fn queued(mut self, at_ms: i64) -> Self {
        self.next.queued = at_ms;
        self
    }

    pub fn started(mut self, at_ms: i64) -> Self {
        self.next.started = at_ms;
        self
    }

    pub fn finished(mut self, at_ms: i64) -> Self {
        self.next.finished = at_ms;
        self
    }

    pub fn aborted(mut self, aborted: bool) -> Self {
        self.next.aborted = aborted;
        self
    }

    pub fn stalled(mut self, stalled: bool) -> Self {
        self.next.stalled = stalled;
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.next.last_error = Some(error.into());
        self
    }

    /// Validate and produce the new snapshot with the set of changed fields.
    ///
    /// Fails if the base snapshot is already terminal or if the new status
    /// belongs to another task kind.
    pub fn apply(self) -> Result<(TaskState, Vec<TaskField>), CoreError> {
        let TaskUpdate { base, mut next } = self;

        if base.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: base.status.to_string(),
                to: next.status.to_string(),
            });
        }
        if next.status.kind() != base.kind {
            return Err(CoreError::InvalidInput(format!(
                "status {} does not belong to a {} task",
                next.status, base.kind
            )));
        }

        if next.status.is_terminal() && next.finished == 0 {
            next.finished = now_ms();
        }

        // queued <= started <= finished, even if the wall clock stepped back
        if next.started != 0 && next.queued != 0 {
            next.started = next.started.max(next.queued);
        }
        if next.finished != 0 {
            let floor = if next.started != 0 {
                next.started
            } else {
                next.queued
            };
            next.finished = next.finished.max(floor);
        }

        let changed = diff(base, &next);
        Ok((next, changed))
    }
}

fn diff(old: &TaskState, new: &TaskState) -> Vec<TaskField> {
    let mut changed = Vec::new();
    if old.description != new.description {
        changed.push(TaskField::Description);
    }
    if old.status != new.status {
        changed.push(TaskField::Status);
    }
    if old.progress != new.progress {
        changed.push(TaskField::Progress);
    }
    if old.queued != new.queued {
        changed.push(TaskField::Queued);
    }
    if old.started != new.started {
        changed.push(TaskField::Started);
    }
    if old.finished != new.finished {
        changed.push(TaskField::Finished);
    }
    if old.aborted != new.aborted {
        changed.push(TaskField::Aborted);
    }
    if old.stalled != new.stalled {
        changed.push(TaskField::Stalled);
    }
    if old.last_error != new.last_error {
        changed.push(TaskField::LastError);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConversionStatus, ManualModeStatus};

    fn conversion() -> TaskState {
        TaskState::new(TaskId::new(1), &NewTask::new(TaskKind::Conversion, "firefox"))
    }

    #[test]
    fn test_new_task_is_init() {
        let task = conversion();
        assert_eq!(task.meta(), MetaStatus::Init);
        assert_eq!(task.progress, -1);
        assert_eq!(task.queued, 0);
    }

    #[test]
    fn test_update_reports_changed_fields() {
        let task = conversion();
        let (next, changed) = task
            .update()
            .status(ConversionStatus::Queued)
            .queued(1_000)
            .progress(-1)
            .apply()
            .unwrap();

        assert_eq!(next.meta(), MetaStatus::Waiting);
        assert_eq!(changed, vec![TaskField::Status, TaskField::Queued]);
    }

    #[test]
    fn test_progress_is_clamped() {
        let task = conversion();
        let (next, _) = task.update().progress(250).apply().unwrap();
        assert_eq!(next.progress, 100);
        let (next, _) = next.update().progress(-40).apply().unwrap();
        assert_eq!(next.progress, -1);
        let (next, _) = next.update().increment_progress(7).apply().unwrap();
        assert_eq!(next.progress, 7);
    }

    #[test]
    fn test_terminal_task_rejects_updates() {
        let task = conversion();
        let (done, changed) = task
            .update()
            .status(ConversionStatus::Complete)
            .apply()
            .unwrap();
        assert!(done.finished > 0);
        assert!(changed.contains(&TaskField::Finished));

        let err = done.update().progress(50).apply().unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_status_of_other_kind_rejected() {
        let task = conversion();
        let err = task
            .update()
            .status(ManualModeStatus::Building)
            .apply()
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_timestamps_stay_ordered() {
        let task = conversion();
        let (next, _) = task
            .update()
            .queued(5_000)
            .started(4_000)
            .finished(3_000)
            .status(ConversionStatus::Failed)
            .apply()
            .unwrap();
        assert_eq!(next.queued, 5_000);
        assert_eq!(next.started, 5_000);
        assert_eq!(next.finished, 5_000);
    }

    #[test]
    fn test_unchanged_update_is_empty() {
        let task = conversion();
        let (_, changed) = task.update().progress(-1).apply().unwrap();
        assert!(changed.is_empty());
    }
}
