//! `POST /v1/agent` — the gateway's native submission endpoint.

use axum::{extract::State, http::StatusCode, Json};

use crate::types::{Request, Response};
use crate::AppState;

/// Submit a request to the scheduler and wait for it to resolve.
///
/// The scheduler's [`Outcome`](crate::types::Outcome) already carries both
/// the HTTP status and the body — this handler just unpacks it.
pub async fn submit(
    State(state): State<AppState>,
    Json(payload): Json<Request>,
) -> (StatusCode, Json<Response>) {
    let outcome = state.scheduler.submit(payload).await;
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.body))
}
