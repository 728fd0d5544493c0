//! Filters and snapshot views over the scheduler's tasks.

use std::sync::Arc;

use capturerun_core::{MetaStatus, TaskKind, TaskState};

/// Selects tasks by coarse status, kind, or owning record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFilter {
    #[default]
    All,
    Waiting,
    Running,
    Finished,
    /// Waiting or running.
    NotFinished,
    Kind(TaskKind),
    Record(i64),
}

impl TaskFilter {
    pub fn matches(&self, task: &TaskState) -> bool {
        match self {
            Self::All => true,
            Self::Waiting => task.meta() == MetaStatus::Waiting,
            Self::Running => task.meta() == MetaStatus::Running,
            Self::Finished => task.meta() == MetaStatus::Finished,
            Self::NotFinished => task.meta() != MetaStatus::Finished,
            Self::Kind(kind) => task.kind == *kind,
            Self::Record(record) => task.record_id == Some(*record),
        }
    }
}

impl From<MetaStatus> for TaskFilter {
    fn from(meta: MetaStatus) -> Self {
        match meta {
            MetaStatus::Init | MetaStatus::Waiting => Self::Waiting,
            MetaStatus::Running => Self::Running,
            MetaStatus::Finished => Self::Finished,
        }
    }
}

/// Consistent snapshot of a set of tasks.
///
/// Taken in one pass under the scheduler lock; iterating it any number of
/// times yields the same tasks in the same order.
#[derive(Debug, Clone, Default)]
pub struct TaskView {
    tasks: Vec<Arc<TaskState>>,
}

impl TaskView {
    pub(crate) fn new(tasks: Vec<Arc<TaskState>>) -> Self {
        Self { tasks }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskState> + '_ {
        self.tasks.iter().map(|task| task.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ids(&self) -> Vec<capturerun_core::TaskId> {
        self.iter().map(|task| task.id).collect()
    }

    /// Owned copies of the snapshots.
    pub fn to_vec(&self) -> Vec<TaskState> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a TaskView {
    type Item = &'a TaskState;
    type IntoIter = Box<dyn Iterator<Item = &'a TaskState> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
