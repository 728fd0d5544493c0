//! Server-sent event stream of scheduler events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};

use crate::http::responses::error_response;
use crate::state::AppState;

/// Stream scheduler events.
///
/// The first event is a `snapshot` of every retained task; each later event
/// is named after its kind (`added`, `updated`, ...). The stream ends when
/// the event bus shuts down.
pub async fn stream_events(State(state): State<Arc<AppState>>) -> Response {
    // Subscribe before taking the snapshot so nothing falls in between
    let Some(receiver) = state.events.subscribe() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Event stream is shut down");
    };
    let snapshot = state.scheduler.get_all_tasks().to_vec();
    info!(tasks = snapshot.len(), "Event stream subscriber connected");

    let initial = stream::once(async move { Ok::<_, Infallible>(json_event("snapshot", &snapshot)) });
    let live = BroadcastStream::new(receiver).map(|item| {
        let event = match item {
            Ok(event) => json_event(event.name(), &event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream lagged, skipping events");
                Event::default().comment(format!("skipped {skipped} events"))
            }
        };
        Ok::<_, Infallible>(event)
    });

    Sse::new(initial.chain(live))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn json_event<T: Serialize>(name: &str, data: &T) -> Event {
    match Event::default().event(name).json_data(data) {
        Ok(event) => event,
        Err(e) => {
            warn!(event = name, error = %e, "Failed to serialize event");
            Event::default().comment(format!("unserializable {name} event"))
        }
    }
}
