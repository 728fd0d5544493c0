//! Manual-mode capture states and requests.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{CoreError, TaskId, Ticket, WorkpoolId};

/// Phase of a manual-mode capture, in the order a capture moves through them.
///
/// A request accumulates the states it has reached; the greatest one is the
/// current state. `Cancelling` sorts after every running phase so a
/// cancellation request always dominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureState {
    Created,
    AcquiringVm,
    VmAcquired,
    PoweringOnVm,
    WaitingForTools,
    NeedsLoginWait,
    NeedsLoginDone,
    PreCaptureWait,
    PreCaptureDone,
    TakingPreCaptureSnapshot,
    InstallationWait,
    InstallationDone,
    TakingPostCaptureSnapshot,
    GeneratingProject,
    BuildingProject,
    VmReleased,
    Cancelling,
    Failure,
    Success,
    Cancelled,
    Finished,
}

impl CaptureState {
    /// Returns true for checkpoints where the capture waits for a human.
    pub fn is_nextable(&self) -> bool {
        self.done_state().is_some()
    }

    /// State that acknowledges a human-gated checkpoint.
    pub fn done_state(&self) -> Option<CaptureState> {
        match self {
            Self::NeedsLoginWait => Some(Self::NeedsLoginDone),
            Self::PreCaptureWait => Some(Self::PreCaptureDone),
            Self::InstallationWait => Some(Self::InstallationDone),
            _ => None,
        }
    }

    /// Returns true once the capture is releasing resources or done.
    pub fn is_ending(&self) -> bool {
        matches!(
            self,
            Self::VmReleased
                | Self::Cancelling
                | Self::Failure
                | Self::Success
                | Self::Cancelled
                | Self::Finished
        )
    }

    /// Overall completion percentage represented by this state.
    pub fn percent(&self) -> i32 {
        match self {
            Self::Created => 5,
            Self::AcquiringVm => 10,
            Self::VmAcquired => 15,
            Self::PoweringOnVm => 20,
            Self::WaitingForTools => 25,
            Self::NeedsLoginWait => 30,
            Self::NeedsLoginDone => 35,
            Self::PreCaptureWait => 45,
            Self::PreCaptureDone | Self::TakingPreCaptureSnapshot => 50,
            Self::InstallationWait => 60,
            Self::InstallationDone => 65,
            Self::TakingPostCaptureSnapshot => 70,
            Self::GeneratingProject => 75,
            Self::BuildingProject => 85,
            Self::VmReleased => 90,
            Self::Cancelling => 99,
            Self::Failure | Self::Success | Self::Cancelled | Self::Finished => 100,
        }
    }
}

/// Everything a client sees when redeeming a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub ticket: Ticket,
    pub task_id: TaskId,
    pub states: BTreeSet<CaptureState>,
    /// Name of the leased VM while one is held.
    pub vm: Option<String>,
    pub project_id: Option<i64>,
    pub last_error: Option<String>,
}

impl CaptureStatus {
    pub fn new(ticket: Ticket, task_id: TaskId) -> Self {
        Self {
            ticket,
            task_id,
            states: BTreeSet::from([CaptureState::Created]),
            vm: None,
            project_id: None,
            last_error: None,
        }
    }

    /// Greatest state reached so far.
    pub fn current(&self) -> CaptureState {
        self.states
            .last()
            .copied()
            .unwrap_or(CaptureState::Created)
    }

    /// Latest state that is not part of winding down.
    pub fn last_running_state(&self) -> CaptureState {
        self.states
            .iter()
            .rev()
            .find(|state| !state.is_ending())
            .copied()
            .unwrap_or(CaptureState::Created)
    }

    pub fn contains(&self, state: CaptureState) -> bool {
        self.states.contains(&state)
    }

    /// Record a state; returns false if it was already reached.
    pub fn insert(&mut self, state: CaptureState) -> bool {
        self.states.insert(state)
    }

    pub fn percent(&self) -> i32 {
        self.current().percent()
    }

    pub fn is_cancelling(&self) -> bool {
        self.contains(CaptureState::Cancelling)
    }

    pub fn is_finished(&self) -> bool {
        self.contains(CaptureState::Finished)
    }

    /// Returns true once the capture has released its VM or settled.
    pub fn is_winding_down(&self) -> bool {
        [
            CaptureState::VmReleased,
            CaptureState::Failure,
            CaptureState::Success,
            CaptureState::Cancelled,
            CaptureState::Finished,
        ]
        .iter()
        .any(|state| self.contains(*state))
    }
}

fn default_autologon() -> bool {
    true
}

/// Parameters of a capture, manual or automatic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Workpool to lease the capture VM from.
    pub workpool: WorkpoolId,

    /// Name of the application being captured.
    pub display_name: String,

    /// Where the installer is downloaded from, if any.
    #[serde(default)]
    pub installer_url: Option<String>,

    /// Silent install command line, if any.
    #[serde(default)]
    pub install_command: Option<String>,

    /// When false the capture pauses for a manual login after boot.
    #[serde(default = "default_autologon")]
    pub autologon: bool,
}

impl CaptureRequest {
    pub fn new(workpool: impl Into<WorkpoolId>, display_name: impl Into<String>) -> Self {
        Self {
            workpool: workpool.into(),
            display_name: display_name.into(),
            installer_url: None,
            install_command: None,
            autologon: true,
        }
    }

    pub fn with_installer(mut self, url: impl Into<String>) -> Self {
        self.installer_url = Some(url.into());
        self
    }

    pub fn with_manual_login(mut self) -> Self {
        self.autologon = false;
        self
    }

    /// Check the request is usable.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.display_name.trim().is_empty() {
            return Err(CoreError::InvalidInput("display name is required".into()));
        }
        if self.workpool.as_str().is_empty() {
            return Err(CoreError::InvalidInput("workpool is required".into()));
        }
        Ok(())
    }
}
