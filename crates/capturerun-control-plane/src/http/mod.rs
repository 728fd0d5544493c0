//! HTTP server for the control plane.
//!
//! Provides endpoints for:
//! - Task queue inspection and control (`/v1/tasks`, `/v1/queue/limits`)
//! - Scheduler event stream (`/v1/events`)
//! - Automatic conversions (`/v1/conversions`)
//! - Manual-mode tickets (`/v1/manual`)
//! - Workpool rosters (`/v1/workpools`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Task queue
        .route("/v1/tasks", get(handlers::list_tasks))
        .route("/v1/tasks/cleanup", post(handlers::cleanup_tasks))
        .route("/v1/tasks/abort-all", post(handlers::abort_all_tasks))
        .route(
            "/v1/tasks/:id",
            get(handlers::get_task).delete(handlers::delete_task),
        )
        .route("/v1/tasks/:id/abort", post(handlers::abort_task))
        .route("/v1/tasks/:id/move", post(handlers::move_task))
        .route("/v1/tasks/:id/unstall", post(handlers::unstall_task))
        .route(
            "/v1/queue/limits",
            get(handlers::get_limits).put(handlers::put_limits),
        )
        .route("/v1/events", get(handlers::stream_events))
        // Jobs
        .route("/v1/conversions", post(handlers::submit_conversion))
        .route("/v1/manual", post(handlers::create_ticket))
        .route("/v1/manual/:ticket", get(handlers::redeem_ticket))
        .route("/v1/manual/:ticket/next", post(handlers::next_ticket))
        .route("/v1/manual/:ticket/cancel", post(handlers::cancel_ticket))
        // Workpools
        .route("/v1/workpools", get(handlers::list_workpools))
        .route(
            "/v1/workpools/:id/instances",
            post(handlers::add_instance),
        )
        .route(
            "/v1/workpools/:id/instances/:instance",
            delete(handlers::remove_instance),
        )
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use capturerun_core::WorkpoolSpec;

    use crate::config::Config;
    use crate::stub::{StubCapturer, StubConverter, StubProvisioner};

    fn state() -> Arc<AppState> {
        let state = AppState::new(
            Config::default(),
            Arc::new(StubProvisioner::new(Duration::from_millis(1))),
            Arc::new(StubCapturer::new(Duration::from_millis(1))),
            Arc::new(StubConverter::new(Duration::from_millis(1))),
        );
        state
            .pool
            .create_workpool(WorkpoolSpec::new("win10", 1))
            .unwrap();
        state
    }

    async fn send(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_router(state());
        let (status, body) = send(router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_not_found() {
        let router = create_router(state());
        let (status, body) = send(router, Method::GET, "/v1/manual/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_ticket_creation_validates_workpool() {
        let router = create_router(state());
        let (status, _) = send(
            router,
            Method::POST,
            "/v1/manual",
            Some(json!({"workpool": "missing", "display_name": "Notepad++"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ticket_round_trip() {
        let state = state();
        let (status, body) = send(
            create_router(Arc::clone(&state)),
            Method::POST,
            "/v1/manual",
            Some(json!({"workpool": "win10", "display_name": "Notepad++", "record_id": 7})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let ticket = body["ticket"].as_str().unwrap().to_string();

        let (status, _) = send(
            create_router(Arc::clone(&state)),
            Method::GET,
            &format!("/v1/manual/{ticket}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, tasks) = send(
            create_router(state),
            Method::GET,
            "/v1/tasks?record_id=7",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tasks.as_array().unwrap().len(), 1);
        assert_eq!(tasks[0]["type"], "MANUAL_MODE_BUILD");
    }

    #[tokio::test]
    async fn test_move_requires_reference_task() {
        let router = create_router(state());
        let (status, _) = send(
            router,
            Method::POST,
            "/v1/tasks/1/move",
            Some(json!({"position": "before"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_limits_round_trip() {
        let state = state();
        let (status, _) = send(
            create_router(Arc::clone(&state)),
            Method::PUT,
            "/v1/queue/limits",
            Some(json!({"max_running": 2, "max_finished": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(create_router(state), Method::GET, "/v1/queue/limits", None).await;
        assert_eq!(body, json!({"max_running": 2, "max_finished": 10}));
    }

    #[tokio::test]
    async fn test_remove_unknown_instance() {
        let router = create_router(state());
        let (status, _) = send(router, Method::DELETE, "/v1/workpools/win10/instances/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
