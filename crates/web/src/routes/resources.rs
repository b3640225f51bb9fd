//! Resource endpoints: submit, list, get and remove.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use keel_reconciler::{ResourceId, ResourceKind, ResourceSpec, ResourceStatus};
use tracing::info;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// POST /api/resources - Submit a desired spec
///
/// Any generation in the body is ignored; the store assigns one.
pub async fn submit_resource(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ResourceSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<ResourceSpec>)> {
    let Json(spec) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let accepted = state.controller.submit(spec).await?;
    info!(id = %accepted.id, generation = accepted.generation, "Spec submitted over HTTP");
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// GET /api/resources - List resource statuses
pub async fn list_resources(State(state): State<AppState>) -> Json<Vec<ResourceStatus>> {
    Json(state.controller.list_status().await)
}

/// GET /api/resources/{namespace}/{kind}/{name}
pub async fn get_resource(
    State(state): State<AppState>,
    Path((namespace, kind, name)): Path<(String, String, String)>,
) -> Result<Json<ResourceStatus>> {
    let id = resource_id(namespace, &kind, name)?;
    state
        .controller
        .status(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("resource '{id}'")))
}

/// DELETE /api/resources/{namespace}/{kind}/{name}
pub async fn remove_resource(
    State(state): State<AppState>,
    Path((namespace, kind, name)): Path<(String, String, String)>,
) -> Result<StatusCode> {
    let id = resource_id(namespace, &kind, name)?;
    state.controller.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn resource_id(namespace: String, kind: &str, name: String) -> Result<ResourceId> {
    let kind: ResourceKind = kind.parse()?;
    Ok(ResourceId::new(namespace, kind, name))
}
