//! `GET /v1/metrics` — the scheduler's consistent point-in-time snapshot.

use axum::{extract::State, Json};

use crate::metrics::MetricsSnapshot;
use crate::AppState;

pub async fn snapshot(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.scheduler.snapshot_metrics().await)
}
