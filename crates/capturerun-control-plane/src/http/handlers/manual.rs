//! Manual-mode ticket handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use capturerun_core::Ticket;

use crate::http::responses::{error_response, CaptureSubmission, NextRequest, TicketResponse};
use crate::manual::ManualModeError;
use crate::scheduler::SchedulerError;
use crate::state::AppState;

/// Create a manual capture; the ticket is returned before it starts.
pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CaptureSubmission>,
) -> Response {
    match state.manual.create(req.capture, req.record_id) {
        Ok(ticket) => (StatusCode::CREATED, Json(TicketResponse { ticket })).into_response(),
        Err(e) => manual_error(e),
    }
}

pub async fn redeem_ticket(
    State(state): State<Arc<AppState>>,
    Path(ticket): Path<String>,
) -> Response {
    match state.manual.redeem(&Ticket::new(ticket)) {
        Ok(status) => Json(status).into_response(),
        Err(e) => manual_error(e),
    }
}

pub async fn next_ticket(
    State(state): State<Arc<AppState>>,
    Path(ticket): Path<String>,
    Json(req): Json<NextRequest>,
) -> Response {
    match state.manual.next(&Ticket::new(ticket), req.expected) {
        Ok(status) => Json(status).into_response(),
        Err(e) => manual_error(e),
    }
}

pub async fn cancel_ticket(
    State(state): State<Arc<AppState>>,
    Path(ticket): Path<String>,
) -> Response {
    match state.manual.cancel(&Ticket::new(ticket)) {
        Ok(status) => Json(status).into_response(),
        Err(e) => manual_error(e),
    }
}

fn manual_error(e: ManualModeError) -> Response {
    let status = match &e {
        ManualModeError::UnknownTicket(_) => StatusCode::NOT_FOUND,
        ManualModeError::RequestInProgress(_) => StatusCode::CONFLICT,
        ManualModeError::Validation(_) => StatusCode::BAD_REQUEST,
        ManualModeError::Scheduler(SchedulerError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
        ManualModeError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}
