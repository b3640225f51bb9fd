//! REST API routes
//!
//! All routes are mounted under the `/api` prefix.
//!
//! ## Route Structure
//!
//! - `GET /api/health` - Health check endpoint
//! - `GET /api/resources` - List resource statuses
//! - `POST /api/resources` - Submit a desired spec
//! - `GET /api/resources/{namespace}/{kind}/{name}` - Status of one resource
//! - `DELETE /api/resources/{namespace}/{kind}/{name}` - Stop managing a resource
//! - `GET /api/metrics` - Controller metrics snapshot

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

pub mod health;
pub mod metrics;
pub mod resources;

/// Create the API router, nested under `/api`.
pub fn create_router() -> Router<AppState> {
    let api_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/resources", post(resources::submit_resource))
        .route("/resources", get(resources::list_resources))
        .route(
            "/resources/{namespace}/{kind}/{name}",
            get(resources::get_resource).delete(resources::remove_resource),
        )
        .route("/metrics", get(metrics::get_metrics));

    Router::new().nest("/api", api_routes)
}
