//! Scheduler lifecycle events.

use serde::{Deserialize, Serialize};

use crate::{TaskField, TaskId, TaskState};

/// Event fired by the scheduler for every task transition.
///
/// Each event carries the task snapshot taken right after the transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Task was admitted to the wait queue.
    Added { task: TaskState },

    /// Task envelope changed; `changed` lists the fields that differ.
    Updated {
        task: TaskState,
        changed: Vec<TaskField>,
    },

    /// Waiting task was moved to the head of the queue.
    MovedToHead { task: TaskState },

    /// Waiting task was moved to the tail of the queue.
    MovedToTail { task: TaskState },

    /// Waiting task now directly follows `after`.
    MovedAfter { task: TaskState, after: TaskId },

    /// Finished task was evicted.
    Removed { task: TaskState },
}

impl TaskEvent {
    /// Snapshot of the task the event is about.
    pub fn task(&self) -> &TaskState {
        match self {
            Self::Added { task }
            | Self::Updated { task, .. }
            | Self::MovedToHead { task }
            | Self::MovedToTail { task }
            | Self::MovedAfter { task, .. }
            | Self::Removed { task } => task,
        }
    }

    /// Event name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::MovedToHead { .. } => "moved_to_head",
            Self::MovedToTail { .. } => "moved_to_tail",
            Self::MovedAfter { .. } => "moved_after",
            Self::Removed { .. } => "removed",
        }
    }
}
