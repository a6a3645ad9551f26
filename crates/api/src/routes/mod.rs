//! Route table.

pub mod onboarding;
pub mod payments;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/install/crm", get(onboarding::crm_install_link))
        .route("/oauth/crm/callback", get(onboarding::crm_callback))
        .route("/oauth/psp/callback", get(onboarding::psp_callback))
        .route("/webhooks/crm", post(webhooks::crm_webhook))
        .route("/webhooks/psp", post(webhooks::psp_webhook))
        .route("/payments/preferences", post(payments::create_preference))
        .route("/reconcile", post(payments::run_reconciliation))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
