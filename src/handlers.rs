use axum::{extract::State, http::Uri, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::health::HealthChecker;
use crate::throttler::ThrottleGate;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<ThrottleGate>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(gate: Arc<ThrottleGate>) -> Self {
        let health = Arc::new(HealthChecker::new(Arc::clone(&gate)));
        Self { gate, health }
    }
}

#[derive(Debug, Serialize)]
pub struct PlaceholderResponse {
    pub path: String,
    pub handled: bool,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health())
}

/// Stand-in for the application's route handlers, which live outside this
/// crate. Lets operators exercise the rule table end to end.
pub async fn placeholder(uri: Uri) -> impl IntoResponse {
    Json(PlaceholderResponse {
        path: uri.path().to_string(),
        handled: true,
    })
}
