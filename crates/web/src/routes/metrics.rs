//! GET /api/metrics

use axum::{extract::State, response::Json};
use keel_reconciler::MetricsSnapshot;

use crate::state::AppState;

pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.controller.metrics().await)
}
