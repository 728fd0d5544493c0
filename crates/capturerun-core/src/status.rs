//! Status enums for tasks.
//!
//! Every task kind has its own detailed status enum; [`TaskStatus`] is the
//! tagged union the scheduler stores, and [`MetaStatus`] is the coarse view
//! derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse lifecycle status derived from a task's detailed status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaStatus {
    /// Constructed but not yet admitted by the scheduler.
    #[default]
    Init,
    /// Queued, waiting for a worker slot.
    Waiting,
    /// Executing on a worker.
    Running,
    /// Reached a terminal status.
    Finished,
}

impl MetaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for MetaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Automatic capture driven by a conversion backend.
    Conversion,
    /// Capture that pauses for a human between phases.
    ManualModeBuild,
}

impl TaskKind {
    /// Type tag reported on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversion => "CONVERSION",
            Self::ManualModeBuild => "MANUAL_MODE_BUILD",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed status of a conversion task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    #[default]
    NewTask,
    Queued,
    Created,
    Downloading,
    Provisioning,
    PreCapture,
    PreInstall,
    Install,
    PostInstall,
    PostCapture,
    Generate,
    PreBuild,
    Build,
    Refresh,
    Finishing,
    Complete,
    Failed,
    Cancelling,
    Cancelled,
}

impl ConversionStatus {
    pub fn meta(&self) -> MetaStatus {
        match self {
            Self::NewTask => MetaStatus::Init,
            Self::Queued => MetaStatus::Waiting,
            Self::Complete | Self::Failed | Self::Cancelled => MetaStatus::Finished,
            _ => MetaStatus::Running,
        }
    }

    /// Returns true before the backend has started real work.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::NewTask | Self::Queued | Self::Created)
    }
}

/// Detailed status of a manual-mode capture task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualModeStatus {
    #[default]
    Created,
    Queued,
    Starting,
    AcquiringVm,
    WaitingForUser,
    Building,
    Complete,
    Failed,
    Cancelled,
}

impl ManualModeStatus {
    pub fn meta(&self) -> MetaStatus {
        match self {
            Self::Created => MetaStatus::Init,
            Self::Queued => MetaStatus::Waiting,
            Self::Starting | Self::AcquiringVm | Self::WaitingForUser | Self::Building => {
                MetaStatus::Running
            }
            Self::Complete | Self::Failed | Self::Cancelled => MetaStatus::Finished,
        }
    }
}

/// Detailed status of any task, tagged by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskStatus {
    Conversion(ConversionStatus),
    ManualMode(ManualModeStatus),
}

impl TaskStatus {
    /// Status of a freshly constructed task.
    pub fn initial(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Conversion => Self::Conversion(ConversionStatus::NewTask),
            TaskKind::ManualModeBuild => Self::ManualMode(ManualModeStatus::Created),
        }
    }

    /// Status assigned on admission to the wait queue.
    pub fn queued(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Conversion => Self::Conversion(ConversionStatus::Queued),
            TaskKind::ManualModeBuild => Self::ManualMode(ManualModeStatus::Queued),
        }
    }

    /// Status assigned when a worker picks the task up.
    pub fn started(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Conversion => Self::Conversion(ConversionStatus::Created),
            TaskKind::ManualModeBuild => Self::ManualMode(ManualModeStatus::Starting),
        }
    }

    pub fn completed(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Conversion => Self::Conversion(ConversionStatus::Complete),
            TaskKind::ManualModeBuild => Self::ManualMode(ManualModeStatus::Complete),
        }
    }

    pub fn failed(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Conversion => Self::Conversion(ConversionStatus::Failed),
            TaskKind::ManualModeBuild => Self::ManualMode(ManualModeStatus::Failed),
        }
    }

    pub fn cancelled(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Conversion => Self::Conversion(ConversionStatus::Cancelled),
            TaskKind::ManualModeBuild => Self::ManualMode(ManualModeStatus::Cancelled),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Conversion(_) => TaskKind::Conversion,
            Self::ManualMode(_) => TaskKind::ManualModeBuild,
        }
    }

    pub fn meta(&self) -> MetaStatus {
        match self {
            Self::Conversion(s) => s.meta(),
            Self::ManualMode(s) => s.meta(),
        }
    }

    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.meta() == MetaStatus::Finished
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversion(s) => write!(f, "{s:?}"),
            Self::ManualMode(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<ConversionStatus> for TaskStatus {
    fn from(status: ConversionStatus) -> Self {
        Self::Conversion(status)
    }
}

impl From<ManualModeStatus> for TaskStatus {
    fn from(status: ManualModeStatus) -> Self {
        Self::ManualMode(status)
    }
}
