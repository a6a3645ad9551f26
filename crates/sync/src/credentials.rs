//! Per-tenant OAuth credential records for both platforms.
//!
//! One record per (platform, tenant_key); records are superseded in place and
//! never deleted. Refresh is idempotent-but-racy: concurrent refreshes may
//! both succeed (last write wins), and a loser that sees the provider reject
//! an already-rotated refresh token re-reads the record instead of retrying.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::crm::CrmClient;
use crate::error::{SyncError, SyncResult};
use crate::psp::PspClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Crm,
    Psp,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Crm => "crm",
            Platform::Psp => "psp",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub platform: Platform,
    pub tenant_key: String,
    pub access_token: String,
    pub refresh_token: String,
    pub public_key: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

/// Row shape shared by every credential query. The platform column is never
/// decoded; callers always know which platform they asked for.
#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    tenant_key: String,
    access_token: String,
    refresh_token: String,
    public_key: Option<String>,
    issued_at: OffsetDateTime,
}

impl CredentialRow {
    fn into_record(self, platform: Platform) -> CredentialRecord {
        CredentialRecord {
            id: self.id,
            platform,
            tenant_key: self.tenant_key,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            public_key: self.public_key,
            issued_at: self.issued_at,
        }
    }
}

const CREDENTIAL_COLUMNS: &str = "id, tenant_key, access_token, refresh_token, public_key, issued_at";

#[derive(Clone)]
pub struct CredentialStore {
    pool: PgPool,
    crm: CrmClient,
    psp: PspClient,
}

impl CredentialStore {
    pub fn new(pool: PgPool, crm: CrmClient, psp: PspClient) -> Self {
        Self { pool, crm, psp }
    }

    pub async fn get(&self, platform: Platform, tenant_key: &str) -> SyncResult<CredentialRecord> {
        let row: Option<CredentialRow> = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE platform = $1 AND tenant_key = $2"
        ))
        .bind(platform.as_str())
        .bind(tenant_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_record(platform))
            .ok_or_else(|| SyncError::CredentialNotFound {
                platform,
                tenant_key: tenant_key.to_string(),
            })
    }

    /// Most recently issued credential for a platform. Used when an inbound
    /// event does not identify the owning account.
    pub async fn latest(&self, platform: Platform) -> SyncResult<CredentialRecord> {
        let row: Option<CredentialRow> = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE platform = $1 \
             ORDER BY issued_at DESC LIMIT 1"
        ))
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_record(platform))
            .ok_or_else(|| SyncError::CredentialNotFound {
                platform,
                tenant_key: "(any)".to_string(),
            })
    }

    pub async fn list_tenants(&self, platform: Platform) -> SyncResult<Vec<String>> {
        let tenants: Vec<String> = sqlx::query_scalar(
            "SELECT tenant_key FROM credentials WHERE platform = $1 ORDER BY tenant_key",
        )
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }

    /// Insert or supersede the record for (platform, tenant_key).
    pub async fn upsert(
        &self,
        platform: Platform,
        tenant_key: &str,
        access_token: &str,
        refresh_token: &str,
        public_key: Option<&str>,
    ) -> SyncResult<CredentialRecord> {
        let row: CredentialRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO credentials (id, platform, tenant_key, access_token, refresh_token, public_key, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (platform, tenant_key) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                public_key = COALESCE(EXCLUDED.public_key, credentials.public_key),
                issued_at = NOW(),
                updated_at = NOW()
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(platform.as_str())
        .bind(tenant_key)
        .bind(access_token)
        .bind(refresh_token)
        .bind(public_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_record(platform))
    }

    /// Refresh the access token with the owning platform.
    ///
    /// On success the stored record is replaced atomically (refresh token too,
    /// if the provider rotated it) and the updated record is returned. On
    /// failure the stored record is left untouched and `RefreshFailed` is
    /// reported; callers treat the credential as invalid rather than retrying.
    pub async fn refresh(&self, record: &CredentialRecord) -> SyncResult<CredentialRecord> {
        let refreshed = match record.platform {
            Platform::Crm => self
                .crm
                .refresh(&record.refresh_token)
                .await
                .map(|t| (t.access_token, t.refresh_token)),
            Platform::Psp => self
                .psp
                .refresh(&record.refresh_token)
                .await
                .map(|t| (t.access_token, t.refresh_token)),
        };

        let (access_token, rotated_refresh) = match refreshed {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(
                    platform = %record.platform,
                    tenant_key = %record.tenant_key,
                    error = %e,
                    "Token refresh rejected by provider"
                );
                return Err(SyncError::RefreshFailed {
                    platform: record.platform,
                    tenant_key: record.tenant_key.clone(),
                });
            }
        };

        let refresh_token = rotated_refresh.unwrap_or_else(|| record.refresh_token.clone());

        let row: CredentialRow = sqlx::query_as(&format!(
            r#"
            UPDATE credentials
            SET access_token = $3, refresh_token = $4, issued_at = NOW(), updated_at = NOW()
            WHERE platform = $1 AND tenant_key = $2
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(record.platform.as_str())
        .bind(&record.tenant_key)
        .bind(&access_token)
        .bind(&refresh_token)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            platform = %record.platform,
            tenant_key = %record.tenant_key,
            "Access token refreshed"
        );

        Ok(row.into_record(record.platform))
    }

    /// Run an outbound call with the stored token; on an authorization
    /// failure refresh exactly once and retry the call at most once.
    ///
    /// A refresh that loses to a concurrent rotation re-reads the stored
    /// record instead of retrying the refresh.
    pub async fn with_fresh_token<T, F, Fut>(
        &self,
        credential: &CredentialRecord,
        call: F,
    ) -> SyncResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
    {
        match call(credential.access_token.clone()).await {
            Err(SyncError::Unauthorized { .. }) => {
                let refreshed = match self.refresh(credential).await {
                    Ok(updated) => updated,
                    Err(SyncError::RefreshFailed { .. }) => {
                        self.get(credential.platform, &credential.tenant_key).await?
                    }
                    Err(e) => return Err(e),
                };
                call(refreshed.access_token).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_as_text() {
        assert_eq!(Platform::Crm.as_str(), "crm");
        assert_eq!(Platform::Psp.as_str(), "psp");
        assert_eq!(Platform::Crm.to_string(), "crm");
    }

    #[test]
    fn platform_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Platform::Psp).unwrap(), "\"psp\"");
    }
}
