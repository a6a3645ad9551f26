//! Checkout preference creation and manual reconciliation runs.

use axum::extract::State;
use axum::Json;
use bridgepay_sync::{
    CreatePreferenceRequest, PaymentPreference, Platform, ReconcileReport,
};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn create_preference(
    State(state): State<AppState>,
    Json(request): Json<CreatePreferenceRequest>,
) -> ApiResult<Json<PaymentPreference>> {
    let preference = state.sync.payments.create_preference(&request).await?;
    Ok(Json(preference))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileParams {
    /// PSP account to reconcile; defaults to the most recently connected.
    pub tenant_key: Option<String>,
    /// Trailing window in hours, default 24.
    pub window_hours: Option<i64>,
}

pub async fn run_reconciliation(
    State(state): State<AppState>,
    Json(params): Json<ReconcileParams>,
) -> ApiResult<Json<ReconcileReport>> {
    let tenant_key = match params.tenant_key {
        Some(key) => key,
        None => state.sync.credentials.latest(Platform::Psp).await?.tenant_key,
    };
    let window = time::Duration::hours(params.window_hours.unwrap_or(24));

    let report = state.sync.reconciliation.reconcile(&tenant_key, window).await?;
    Ok(Json(report))
}
