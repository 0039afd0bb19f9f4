//! `POST /v1/messages` — Anthropic-Messages-API-compatible submission
//! endpoint, for clients that already speak that wire format.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;

use crate::vendor::{translate_outcome, translate_request, MessagesError, MessagesRequest, VendorErrorDetail};
use crate::AppState;

pub async fn submit(
    State(state): State<AppState>,
    Json(payload): Json<MessagesRequest>,
) -> (StatusCode, Json<Value>) {
    let request = match translate_request(payload) {
        Ok(r) => r,
        Err(detail) => {
            let body = MessagesError {
                response_type: "error",
                error: VendorErrorDetail {
                    error_type: "invalid_request_error",
                    message: detail,
                },
            };
            return (StatusCode::BAD_REQUEST, Json(serde_json::to_value(body).unwrap_or_default()));
        }
    };

    let outcome = state.scheduler.submit(request).await;
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let body = match translate_outcome(outcome) {
        Ok(response) => serde_json::to_value(response).unwrap_or_default(),
        Err(err) => serde_json::to_value(err).unwrap_or_default(),
    };
    (status, Json(body))
}
