//! Outbound CRM sync after a payment completes.
//!
//! Fire-and-forget with one bounded retry: the webhook that triggered the
//! dispatch has already been acknowledged, so every failure here is logged
//! with enough structure to query and then swallowed. A crash between the
//! paid transition and this dispatch is a bounded, reconciliation-detectable
//! gap, not silent loss.

use sqlx::PgPool;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::credentials::{CredentialStore, Platform};
use crate::crm::CrmClient;
use crate::error::{SyncError, SyncResult};

/// Tag applied to the remote contact when its payment completes.
pub const PAID_TAG: &str = "payment_confirmed";
/// Custom field recording the payment state on the remote contact.
pub const PAYMENT_STATUS_FIELD: &str = "payment_status";
pub const PAYMENT_STATUS_PAID: &str = "paid";

#[derive(Clone)]
pub struct SyncDispatcher {
    pool: PgPool,
    crm: CrmClient,
    credentials: CredentialStore,
}

impl SyncDispatcher {
    pub fn new(pool: PgPool, crm: CrmClient, credentials: CredentialStore) -> Self {
        Self {
            pool,
            crm,
            credentials,
        }
    }

    /// Tag the remote contact and set its payment-status field.
    ///
    /// Never fails the caller. Transient transport errors get exactly one
    /// retry; everything else is logged and dropped.
    pub async fn notify_paid(&self, contact_external_id: &str) {
        let retry = FixedInterval::from_millis(250).take(1);
        let outcome = RetryIf::spawn(
            retry,
            || self.push_paid_markers(contact_external_id),
            |err: &SyncError| matches!(err, SyncError::RemoteCallFailed { .. }),
        )
        .await;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    contact_external_id = %contact_external_id,
                    "Contact tagged after payment"
                );
            }
            Err(e) => {
                tracing::error!(
                    contact_external_id = %contact_external_id,
                    error = %e,
                    "Contact sync after payment failed; webhook already acknowledged"
                );
            }
        }
    }

    async fn push_paid_markers(&self, contact_external_id: &str) -> SyncResult<()> {
        let tenant_key = self.resolve_tenant(contact_external_id).await?;

        let credential = self.credentials.get(Platform::Crm, &tenant_key).await?;
        self.credentials
            .with_fresh_token(&credential, |token| {
                let crm = self.crm.clone();
                let contact = contact_external_id.to_string();
                async move { crm.add_tag(&token, &contact, PAID_TAG).await }
            })
            .await?;

        // Re-read: the first call may have rotated the stored token.
        let credential = self.credentials.get(Platform::Crm, &tenant_key).await?;
        self.credentials
            .with_fresh_token(&credential, |token| {
                let crm = self.crm.clone();
                let contact = contact_external_id.to_string();
                async move {
                    crm.set_custom_field(&token, &contact, PAYMENT_STATUS_FIELD, PAYMENT_STATUS_PAID)
                        .await
                }
            })
            .await?;

        Ok(())
    }

    /// The CRM tenant owning a contact: taken from the contact projection,
    /// falling back to the most recently connected CRM account.
    async fn resolve_tenant(&self, contact_external_id: &str) -> SyncResult<String> {
        let tenant: Option<Option<String>> =
            sqlx::query_scalar("SELECT tenant_key FROM contacts WHERE external_id = $1")
                .bind(contact_external_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(Some(key)) = tenant {
            return Ok(key);
        }
        Ok(self.credentials.latest(Platform::Crm).await?.tenant_key)
    }
}
