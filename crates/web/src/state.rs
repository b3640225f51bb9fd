//! Shared application state for handlers.

use keel_reconciler::Controller;

/// State handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
}

impl AppState {
    pub const fn new(controller: Controller) -> Self {
        Self { controller }
    }
}
