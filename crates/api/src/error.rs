//! API error responses.
//!
//! Onboarding failures are terminal and user-visible; the tenant restarts
//! the flow. Provider-side failures surface as 502 so they are not mistaken
//! for client mistakes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bridgepay_sync::SyncError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Sync(e) => match e {
                SyncError::StateMismatch
                | SyncError::AuthorizationDenied { .. }
                | SyncError::Config(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                SyncError::CredentialNotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                SyncError::MissingTenantIdentity { .. }
                | SyncError::MalformedTokenResponse { .. }
                | SyncError::RefreshFailed { .. }
                | SyncError::Unauthorized { .. }
                | SyncError::RemoteCallFailed { .. } => (StatusCode::BAD_GATEWAY, e.to_string()),
                SyncError::Database(_) | SyncError::ReportIo(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
                }
            },
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
