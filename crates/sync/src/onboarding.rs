//! Two-leg OAuth onboarding chain.
//!
//! The CRM and the PSP know nothing of each other, so a locally-owned
//! correlation token is threaded through both redirects as the `state`
//! parameter. The token is single-use per leg and binds the *result* of the
//! first leg (the resolved tenant key), not merely the fact that it was
//! attempted; a replayed first-leg redirect therefore cannot hijack the
//! second leg.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credentials::{CredentialStore, Platform};
use crate::crm::{self, CrmClient};
use crate::error::{SyncError, SyncResult};
use crate::psp::PspClient;

/// Result of the first (CRM) leg: the tenant is connected to the CRM and the
/// browser should be redirected onward to the PSP authorization URL.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CrmLegOutcome {
    pub tenant_key: String,
    pub psp_authorize_url: String,
}

/// Terminal state: both credentials exist and webhooks may begin.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OnboardingComplete {
    pub crm_tenant_key: String,
    pub psp_tenant_key: String,
    pub public_key: Option<String>,
}

#[derive(Clone)]
pub struct OnboardingChain {
    pool: PgPool,
    crm: CrmClient,
    psp: PspClient,
    credentials: CredentialStore,
}

impl OnboardingChain {
    pub fn new(pool: PgPool, crm: CrmClient, psp: PspClient, credentials: CredentialStore) -> Self {
        Self {
            pool,
            crm,
            psp,
            credentials,
        }
    }

    /// Begin onboarding: persist a fresh correlation token with no resolved
    /// tenant and return the CRM authorization URL carrying it as `state`.
    pub async fn start(&self) -> SyncResult<String> {
        let token = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO correlation_tokens (token, resolved_tenant_key) VALUES ($1, NULL)")
            .bind(&token)
            .execute(&self.pool)
            .await?;

        tracing::info!(state = %token, "Onboarding started");
        self.crm.authorize_url(&token)
    }

    /// First-leg callback: exchange the code, resolve the tenant identity,
    /// store the CRM credential, and mint the second-leg token.
    pub async fn crm_callback(&self, code: &str, state: &str) -> SyncResult<CrmLegOutcome> {
        let known: Option<(String,)> =
            sqlx::query_as("SELECT token FROM correlation_tokens WHERE token = $1")
                .bind(state)
                .fetch_optional(&self.pool)
                .await?;
        if known.is_none() {
            tracing::warn!(state = %state, "CRM callback with unknown state");
            return Err(SyncError::StateMismatch);
        }

        let tokens = self.crm.exchange_code(code).await?;

        // The tenant id usually rides on the token response; fall back to the
        // identity lookup when it does not. First non-empty location wins.
        let tenant_key = match tokens.location_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let identity = self.crm.fetch_identity(&tokens.access_token).await?;
                crm::first_location_id(&identity).ok_or_else(|| {
                    SyncError::MissingTenantIdentity {
                        platform: Platform::Crm,
                        details: identity.to_string(),
                    }
                })?
            }
        };

        self.credentials
            .upsert(
                Platform::Crm,
                &tenant_key,
                &tokens.access_token,
                tokens.refresh_token.as_deref().unwrap_or_default(),
                None,
            )
            .await?;

        // Mint the second-leg token in place: new opaque value (the first is
        // consumed for CRM purposes) now bound to the resolved tenant. A
        // replayed callback finds the old value gone and fails here.
        let next_state = Uuid::new_v4().to_string();
        let minted = sqlx::query(
            "UPDATE correlation_tokens SET token = $2, resolved_tenant_key = $3 WHERE token = $1",
        )
        .bind(state)
        .bind(&next_state)
        .bind(&tenant_key)
        .execute(&self.pool)
        .await?;
        if minted.rows_affected() == 0 {
            return Err(SyncError::StateMismatch);
        }

        tracing::info!(tenant_key = %tenant_key, "CRM leg complete; chaining to PSP");

        Ok(CrmLegOutcome {
            psp_authorize_url: self.psp.authorize_url(&next_state)?,
            tenant_key,
        })
    }

    /// Second-leg callback. A `state` this chain never issued, or one whose
    /// first leg never resolved a tenant, is rejected outright: binding the
    /// PSP credential to a guessed tenant would silently misattribute
    /// payments across tenants.
    pub async fn psp_callback(
        &self,
        code: Option<&str>,
        state: Option<&str>,
        error: Option<&str>,
    ) -> SyncResult<OnboardingComplete> {
        if let Some(reason) = error {
            tracing::warn!(reason = %reason, "PSP authorization denied");
            return Err(SyncError::AuthorizationDenied {
                platform: Platform::Psp,
                reason: reason.to_string(),
            });
        }
        let code = code.ok_or_else(|| SyncError::AuthorizationDenied {
            platform: Platform::Psp,
            reason: "callback carried no authorization code".to_string(),
        })?;
        let state = state.ok_or(SyncError::StateMismatch)?;

        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT resolved_tenant_key FROM correlation_tokens WHERE token = $1")
                .bind(state)
                .fetch_optional(&self.pool)
                .await?;
        let crm_tenant_key = match row {
            Some((Some(key),)) => key,
            Some((None,)) => {
                tracing::warn!(state = %state, "PSP callback with unresolved first leg");
                return Err(SyncError::StateMismatch);
            }
            None => {
                tracing::warn!(state = %state, "PSP callback with unknown state");
                return Err(SyncError::StateMismatch);
            }
        };

        let tokens = self.psp.exchange_code(code).await?;
        let Some(psp_tenant_key) = tokens.user_id.clone() else {
            return Err(SyncError::MalformedTokenResponse {
                platform: Platform::Psp,
                raw: "token response missing user_id".to_string(),
            });
        };

        let public_key = match self.psp.fetch_public_key(&tokens.access_token).await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "PSP identity lookup failed after token exchange");
                None
            }
        };

        self.credentials
            .upsert(
                Platform::Psp,
                &psp_tenant_key,
                &tokens.access_token,
                tokens.refresh_token.as_deref().unwrap_or_default(),
                public_key.as_deref(),
            )
            .await?;

        // The chain is complete; consume the token.
        sqlx::query("DELETE FROM correlation_tokens WHERE token = $1")
            .bind(state)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            crm_tenant_key = %crm_tenant_key,
            psp_tenant_key = %psp_tenant_key,
            "Onboarding complete"
        );

        Ok(OnboardingComplete {
            crm_tenant_key,
            psp_tenant_key,
            public_key,
        })
    }

    /// Delete correlation tokens from abandoned flows.
    pub async fn purge_stale_tokens(&self, max_age: time::Duration) -> SyncResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let result = sqlx::query("DELETE FROM correlation_tokens WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged = purged, "Stale correlation tokens purged");
        }
        Ok(purged)
    }
}
