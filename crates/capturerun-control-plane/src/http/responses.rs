//! HTTP request and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use capturerun_core::{
    CaptureRequest, CaptureState, Instance, MetaStatus, TaskId, TaskKind, TaskState, Ticket,
};

// ============================================================================
// Task queue types
// ============================================================================

/// Query string for the task list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    /// Coarse status filter (`WAITING`, `RUNNING`, `FINISHED`).
    pub meta: Option<MetaStatus>,

    /// Task kind filter (`CONVERSION`, `MANUAL_MODE_BUILD`).
    pub kind: Option<TaskKind>,

    /// Owning record filter.
    pub record_id: Option<i64>,
}

impl TaskQuery {
    pub fn matches(&self, task: &TaskState) -> bool {
        self.meta.map_or(true, |meta| task.meta() == meta)
            && self.kind.map_or(true, |kind| task.kind == kind)
            && self
                .record_id
                .map_or(true, |record| task.record_id == Some(record))
    }
}

/// Where to move a waiting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovePosition {
    Head,
    Tail,
    Before,
    After,
}

/// Request body for the move endpoint.
#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub position: MovePosition,

    /// Reference task for `before` and `after`.
    #[serde(default)]
    pub other: Option<TaskId>,
}

/// Response for the move endpoint.
#[derive(Debug, Serialize)]
pub struct MoveResponse {
    pub moved: bool,
}

/// Response for the abort-all endpoint.
#[derive(Debug, Serialize)]
pub struct AbortAllResponse {
    pub aborted: usize,
}

/// Response for the cleanup endpoint.
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: Vec<TaskId>,
}

// ============================================================================
// Capture submission types
// ============================================================================

/// Request body for creating a conversion or a manual-mode ticket.
#[derive(Debug, Deserialize)]
pub struct CaptureSubmission {
    #[serde(flatten)]
    pub capture: CaptureRequest,

    /// Record that owns the capture, if any.
    #[serde(default)]
    pub record_id: Option<i64>,
}

/// Response for the ticket creation endpoint.
#[derive(Debug, Serialize)]
pub struct TicketResponse {
    pub ticket: Ticket,
}

/// Request body for acknowledging a user checkpoint.
#[derive(Debug, Deserialize)]
pub struct NextRequest {
    /// Checkpoint the client believes the capture is parked at.
    pub expected: CaptureState,
}

// ============================================================================
// Workpool types
// ============================================================================

/// Request body for registering an instance.
#[derive(Debug, Deserialize)]
pub struct AddInstanceRequest {
    /// Hypervisor-side VM name.
    pub name: String,
}

/// Response for the instance removal endpoint.
#[derive(Debug, Serialize)]
pub struct RemoveInstanceResponse {
    /// True when removal waits for the instance to become idle.
    pub deferred: bool,

    /// The removed instance, when removal was immediate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Build an error response with the given status.
pub fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}
