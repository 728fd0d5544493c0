//! Task queue handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use capturerun_core::TaskId;

use crate::config::QueueLimits;
use crate::conversion::ConversionError;
use crate::http::responses::{
    error_response, AbortAllResponse, CaptureSubmission, CleanupResponse, MovePosition,
    MoveRequest, MoveResponse, TaskQuery,
};
use crate::scheduler::SchedulerError;
use crate::state::AppState;

/// List tasks, finished first, then running, then waiting in queue order.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskQuery>,
) -> impl IntoResponse {
    let tasks = state.scheduler.get_tasks_where(|task| query.matches(task));
    Json(tasks.to_vec())
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.scheduler.find_task_by_id(TaskId::new(id)) {
        Some(task) => Json(task).into_response(),
        None => not_found(id),
    }
}

/// Evict one finished task.
pub async fn delete_task(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    let id = TaskId::new(id);
    if state.scheduler.cleanup_task(id) {
        StatusCode::NO_CONTENT.into_response()
    } else if state.scheduler.find_task_by_id(id).is_some() {
        error_response(StatusCode::CONFLICT, format!("Task {id} is not finished"))
    } else {
        not_found(id.get())
    }
}

pub async fn abort_task(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.scheduler.abort_task(TaskId::new(id)) {
        Some(task) => Json(task).into_response(),
        None => not_found(id),
    }
}

/// Reorder a waiting task.
pub async fn move_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(req): Json<MoveRequest>,
) -> Response {
    let id = TaskId::new(id);
    let scheduler = &state.scheduler;

    let moved = match (req.position, req.other) {
        (MovePosition::Head, _) => scheduler.move_to_head(id),
        (MovePosition::Tail, _) => scheduler.move_to_tail(id),
        (MovePosition::Before, Some(other)) => scheduler.move_before(id, other),
        (MovePosition::After, Some(other)) => scheduler.move_after(id, other),
        (MovePosition::Before | MovePosition::After, None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "`other` is required for before/after moves",
            );
        }
    };
    Json(MoveResponse { moved }).into_response()
}

pub async fn unstall_task(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.scheduler.unstall(TaskId::new(id)) {
        Some(task) => Json(task).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Task {id} is not a running conversion"),
        ),
    }
}

/// Evict every finished task.
pub async fn cleanup_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let removed = state
        .scheduler
        .cleanup()
        .into_iter()
        .map(|task| task.id)
        .collect();
    Json(CleanupResponse { removed })
}

pub async fn abort_all_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let aborted = state.scheduler.abort_all_tasks();
    Json(AbortAllResponse { aborted })
}

pub async fn get_limits(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.limits())
}

/// Replace the queue limits; takes effect at the next scheduling decision.
pub async fn put_limits(
    State(state): State<Arc<AppState>>,
    Json(limits): Json<QueueLimits>,
) -> impl IntoResponse {
    state.set_limits(limits);
    Json(limits)
}

/// Queue an automatic conversion.
pub async fn submit_conversion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CaptureSubmission>,
) -> Response {
    match state.submit_conversion(req.capture, req.record_id) {
        Ok(task) => {
            info!(task_id = %task.id, "Conversion queued via HTTP");
            (StatusCode::CREATED, Json(task)).into_response()
        }
        Err(ConversionError::Validation(message)) => {
            error_response(StatusCode::BAD_REQUEST, message)
        }
        Err(ConversionError::Scheduler(e)) => scheduler_error(e),
    }
}

fn scheduler_error(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn not_found(id: u64) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("Task not found: {id}"))
}
