//! Error taxonomy for the sync engine.
//!
//! Onboarding errors are terminal and user-visible (the tenant restarts the
//! flow). Ingestion outcomes that are non-fatal to the sender (unresolvable,
//! not-found, duplicate) are NOT errors; they live in
//! [`crate::ingest::IngestResult`] so webhook handlers can acknowledge them.

use thiserror::Error;

use crate::credentials::Platform;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The `state` parameter does not match any live correlation token, or
    /// the matched token never completed the first leg.
    #[error("no onboarding flow matches the supplied state parameter")]
    StateMismatch,

    /// The CRM token response carried no tenant identifier and the identity
    /// lookup produced none either. Carries the raw provider payload for
    /// operator diagnosis.
    #[error("tenant identity could not be resolved from {platform}: {details}")]
    MissingTenantIdentity { platform: Platform, details: String },

    #[error("authorization denied by {platform}: {reason}")]
    AuthorizationDenied { platform: Platform, reason: String },

    #[error("token refresh failed for {platform}/{tenant_key}")]
    RefreshFailed { platform: Platform, tenant_key: String },

    #[error("no credential stored for {platform}/{tenant_key}")]
    CredentialNotFound { platform: Platform, tenant_key: String },

    /// The remote platform rejected the stored access token. Call sites
    /// refresh exactly once and retry at most once.
    #[error("{platform} rejected the access token")]
    Unauthorized { platform: Platform },

    /// A token endpoint answered without an `access_token`. Fatal to the leg;
    /// carries the raw payload for operator diagnosis.
    #[error("malformed token response from {platform}: {raw}")]
    MalformedTokenResponse { platform: Platform, raw: String },

    #[error("remote call to {platform} failed: {context}")]
    RemoteCallFailed { platform: Platform, context: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to write reconciliation report: {0}")]
    ReportIo(#[from] std::io::Error),
}

impl SyncError {
    /// Wrap a transport-level failure talking to a provider.
    pub(crate) fn remote(platform: Platform, err: reqwest::Error) -> Self {
        SyncError::RemoteCallFailed {
            platform,
            context: err.to_string(),
        }
    }
}
