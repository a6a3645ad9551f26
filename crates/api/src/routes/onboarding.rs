//! Onboarding: install link and the two OAuth callbacks.
//!
//! The CRM callback answers with a redirect so the browser flows straight
//! into the PSP authorization without any intermediate page.

use axum::extract::{Query, State};
use axum::response::Redirect;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    #[allow(dead_code)]
    pub error_description: Option<String>,
}

/// Start onboarding: mint a correlation token and hand back the CRM
/// authorization link for the tenant's browser.
pub async fn crm_install_link(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let install_link = state.sync.onboarding.start().await?;
    Ok(Json(json!({ "install_link": install_link })))
}

/// First-leg callback: finish the CRM exchange and chain into the PSP flow.
pub async fn crm_callback(
    State(state): State<AppState>,
    Query(params): Query<OAuthCallbackParams>,
) -> ApiResult<Redirect> {
    let code = params
        .code
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing code".to_string()))?;
    let flow_state = params
        .state
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing state".to_string()))?;

    let outcome = state.sync.onboarding.crm_callback(code, flow_state).await?;
    Ok(Redirect::temporary(&outcome.psp_authorize_url))
}

/// Second-leg callback: terminal state of the onboarding chain.
pub async fn psp_callback(
    State(state): State<AppState>,
    Query(params): Query<OAuthCallbackParams>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .sync
        .onboarding
        .psp_callback(
            params.code.as_deref(),
            params.state.as_deref(),
            params.error.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "status": "connected",
        "crm_tenant_key": outcome.crm_tenant_key,
        "psp_tenant_key": outcome.psp_tenant_key,
        "public_key": outcome.public_key,
    })))
}
