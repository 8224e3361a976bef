//! HTTP route definitions

pub mod billing;
pub mod generate;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/billing/checkout", post(billing::create_checkout))
        .route("/api/billing/upgrade", post(billing::upgrade_plan))
        .route("/api/billing/status", get(billing::billing_status))
        .route("/api/billing/free-grant", post(billing::claim_free_grant))
        .route("/api/billing/webhook", post(billing::stripe_webhook))
        .route("/api/generate", post(generate::generate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
