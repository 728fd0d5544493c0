//! Workpool roster handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use capturerun_core::{InstanceId, WorkpoolId};

use crate::http::responses::{error_response, AddInstanceRequest, RemoveInstanceResponse};
use crate::state::AppState;
use crate::workpool::{LeaseError, RemoveOutcome};

pub async fn list_workpools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pool.workpools())
}

/// Register an existing VM with a workpool.
pub async fn add_instance(
    State(state): State<Arc<AppState>>,
    Path(workpool): Path<String>,
    Json(req): Json<AddInstanceRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Instance name is required");
    }
    match state.pool.add_instance(&WorkpoolId::new(workpool), req.name) {
        Ok(instance) => (StatusCode::CREATED, Json(instance)).into_response(),
        Err(e) => lease_error(e),
    }
}

/// Remove an instance, deferring while it is leased or provisioning.
pub async fn remove_instance(
    State(state): State<Arc<AppState>>,
    Path((workpool, instance)): Path<(String, u64)>,
) -> Response {
    let workpool = WorkpoolId::new(workpool);
    match state
        .pool
        .remove_instance(&workpool, InstanceId::new(instance))
    {
        Ok(RemoveOutcome::Removed(instance)) => Json(RemoveInstanceResponse {
            deferred: false,
            instance: Some(instance),
        })
        .into_response(),
        Ok(RemoveOutcome::Deferred) => (
            StatusCode::ACCEPTED,
            Json(RemoveInstanceResponse {
                deferred: true,
                instance: None,
            }),
        )
            .into_response(),
        Err(e) => lease_error(e),
    }
}

fn lease_error(e: LeaseError) -> Response {
    let status = match &e {
        LeaseError::UnknownWorkpool(_)
        | LeaseError::UnknownInstance { .. }
        | LeaseError::UnknownLease(_) => StatusCode::NOT_FOUND,
        LeaseError::WorkpoolExists(_) | LeaseError::WorkpoolBusy(_) => StatusCode::CONFLICT,
        LeaseError::WorkpoolDeleted(_) => StatusCode::GONE,
        LeaseError::LeaseUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, e.to_string())
}
