//! Inbound webhook endpoints.
//!
//! Unresolvable, not-found, and duplicate events are acknowledged with 200
//! uniformly; anything else invites a redelivery storm from the sender.
//! Only genuine processing failures (database down, provider unreachable
//! during a detail fetch) surface as errors so the sender retries.

use axum::extract::State;
use axum::Json;
use bridgepay_sync::{IngestResult, Platform};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn crm_webhook(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<Json<IngestResult>> {
    let result = state.sync.ingestor.ingest(Platform::Crm, &payload).await?;
    Ok(Json(result))
}

pub async fn psp_webhook(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<Json<IngestResult>> {
    let result = state.sync.ingestor.ingest(Platform::Psp, &payload).await?;
    Ok(Json(result))
}
