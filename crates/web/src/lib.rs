//! keel HTTP API
//!
//! Exposes a [`keel_reconciler::Controller`] over JSON: submit desired specs,
//! read statuses, stop managing resources and read metrics. Errors are
//! returned as RFC 7807 problem details.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{AppError, ErrorResponse};
pub use routes::health::HealthResponse;
pub use server::{create_app, run_server};
pub use state::AppState;
