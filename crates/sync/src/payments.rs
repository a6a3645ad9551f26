//! Checkout preference lifecycle.
//!
//! Creates the PSP-side checkout preference for an appointment and stores the
//! local row whose correlation key (`appointment_<key>`) later payment
//! webhooks resolve against.

use serde::Deserialize;
use serde_json::json;

use crate::config::ServiceSettings;
use crate::credentials::{CredentialStore, Platform};
use crate::error::{SyncError, SyncResult};
use crate::projections::{PaymentPreference, ProjectionStore};
use crate::psp::{BackUrls, PreferenceItem, PreferenceRequest, PspClient};

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePreferenceRequest {
    /// Correlation key of the appointment being paid for.
    pub appointment_key: String,
    /// CRM external id of the paying contact.
    pub contact_key: String,
    pub amount_cents: i64,
    pub description: String,
    /// PSP account to bill through; defaults to the most recently connected.
    pub psp_tenant_key: Option<String>,
}

#[derive(Clone)]
pub struct PaymentService {
    projections: ProjectionStore,
    psp: PspClient,
    credentials: CredentialStore,
    settings: ServiceSettings,
}

impl PaymentService {
    pub fn new(
        projections: ProjectionStore,
        psp: PspClient,
        credentials: CredentialStore,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            projections,
            psp,
            credentials,
            settings,
        }
    }

    /// Create a checkout preference with the PSP and persist its projection.
    pub async fn create_preference(
        &self,
        request: &CreatePreferenceRequest,
    ) -> SyncResult<PaymentPreference> {
        if request.amount_cents <= 0 {
            return Err(SyncError::Config(
                "amount_cents must be positive".to_string(),
            ));
        }

        let credential = match request.psp_tenant_key.as_deref() {
            Some(tenant_key) => self.credentials.get(Platform::Psp, tenant_key).await?,
            None => self.credentials.latest(Platform::Psp).await?,
        };

        let external_reference = format!("appointment_{}", request.appointment_key);
        let preference = PreferenceRequest {
            items: vec![PreferenceItem {
                title: request.description.clone(),
                quantity: 1,
                unit_price: request.amount_cents as f64 / 100.0,
                currency_id: self.settings.currency.clone(),
            }],
            external_reference,
            metadata: json!({
                "appointment_id": request.appointment_key,
                "contact_id": request.contact_key,
            }),
            back_urls: BackUrls {
                success: format!("{}/payments/success", self.settings.public_url),
                failure: format!("{}/payments/failure", self.settings.public_url),
                pending: format!("{}/payments/pending", self.settings.public_url),
            },
            auto_return: "approved".to_string(),
            notification_url: format!("{}/webhooks/psp", self.settings.public_url),
        };

        let created = self
            .credentials
            .with_fresh_token(&credential, |token| {
                let psp = self.psp.clone();
                let preference = preference.clone();
                async move { psp.create_preference(&token, &preference).await }
            })
            .await?;

        let stored = self
            .projections
            .insert_preference(
                &request.appointment_key,
                &request.contact_key,
                &created.id,
                &created.init_point,
                request.amount_cents,
            )
            .await?;

        tracing::info!(
            preference_id = %stored.preference_id,
            appointment_key = %stored.appointment_key,
            amount_cents = stored.amount_cents,
            "Checkout preference created"
        );

        Ok(stored)
    }
}
