//! Periodic reconciliation of the local payment ledger against the PSP.
//!
//! Strictly an observability pass: it reads the PSP's authoritative ledger
//! over a trailing window, diffs it against local preferences by payment
//! reference, and reports discrepancies. It never mutates state; corrections
//! flow through the same idempotent webhook-application path as live
//! traffic so there is exactly one write path for the paid invariant.

use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;

use crate::credentials::{CredentialStore, Platform};
use crate::error::SyncResult;
use crate::projections::{PaymentPreference, ProjectionStore, PAID_STATUS};
use crate::psp::{amount_to_cents, PspClient, RemotePayment};

/// Local status reported when the PSP knows a payment this system does not.
pub const LOCAL_STATUS_MISSING: &str = "not_found";

/// One flat report record per detected mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub payment_reference: String,
    pub local_status: String,
    pub remote_status: String,
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub tenant_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    /// Remote payments examined in the window.
    pub scanned: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub report_path: String,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    projections: ProjectionStore,
    credentials: CredentialStore,
    psp: PspClient,
    report_dir: PathBuf,
}

impl ReconciliationEngine {
    pub fn new(
        projections: ProjectionStore,
        credentials: CredentialStore,
        psp: PspClient,
        report_dir: PathBuf,
    ) -> Self {
        Self {
            projections,
            credentials,
            psp,
            report_dir,
        }
    }

    /// Diff the PSP ledger over the trailing `window` against local state.
    ///
    /// A failure to reach the PSP fails the run; partial data is never
    /// reported as a completed reconciliation.
    pub async fn reconcile(
        &self,
        tenant_key: &str,
        window: time::Duration,
    ) -> SyncResult<ReconcileReport> {
        let credential = self.credentials.get(Platform::Psp, tenant_key).await?;
        let since = OffsetDateTime::now_utc() - window;
        let remote_payments = self
            .credentials
            .with_fresh_token(&credential, |token| {
                let psp = self.psp.clone();
                async move { psp.search_payments(&token, since).await }
            })
            .await?;

        let mut discrepancies = Vec::new();
        for remote in &remote_payments {
            let local = self
                .projections
                .find_preference_by_payment_reference(&remote.id)
                .await?;
            if let Some(found) = classify(remote, local.as_ref()) {
                discrepancies.push(found);
            }
        }

        let generated_at = OffsetDateTime::now_utc();
        let report_path = self.write_report(generated_at, &discrepancies).await?;

        tracing::info!(
            tenant_key = %tenant_key,
            scanned = remote_payments.len(),
            discrepancies = discrepancies.len(),
            report_path = %report_path,
            "Reconciliation complete"
        );

        Ok(ReconcileReport {
            tenant_key: tenant_key.to_string(),
            generated_at,
            scanned: remote_payments.len(),
            discrepancies,
            report_path,
        })
    }

    async fn write_report(
        &self,
        generated_at: OffsetDateTime,
        discrepancies: &[Discrepancy],
    ) -> SyncResult<String> {
        tokio::fs::create_dir_all(&self.report_dir).await?;
        let path = self
            .report_dir
            .join(format!("reconcile_{}.jsonl", generated_at.unix_timestamp()));

        let mut contents = String::new();
        for discrepancy in discrepancies {
            let line = serde_json::to_string(discrepancy).map_err(std::io::Error::other)?;
            contents.push_str(&line);
            contents.push('\n');
        }
        tokio::fs::write(&path, contents).await?;

        Ok(path.to_string_lossy().into_owned())
    }
}

/// Compare one remote payment against the local preference holding its
/// reference. Matching status means silence.
fn classify(remote: &RemotePayment, local: Option<&PaymentPreference>) -> Option<Discrepancy> {
    let amount_cents = remote.transaction_amount.map(amount_to_cents);
    match local {
        None => Some(Discrepancy {
            payment_reference: remote.id.clone(),
            local_status: LOCAL_STATUS_MISSING.to_string(),
            remote_status: remote.status.clone(),
            amount_cents,
        }),
        Some(preference) if statuses_equivalent(&preference.status, &remote.status) => None,
        Some(preference) => Some(Discrepancy {
            payment_reference: remote.id.clone(),
            local_status: preference.status.clone(),
            remote_status: remote.status.clone(),
            amount_cents,
        }),
    }
}

/// The PSP's terminal "approved" maps to the local terminal "paid".
fn statuses_equivalent(local: &str, remote: &str) -> bool {
    local == remote || (local == PAID_STATUS && remote == "approved")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn remote(id: &str, status: &str, amount: f64) -> RemotePayment {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": status,
            "transaction_amount": amount,
        }))
        .unwrap()
    }

    fn local(status: &str, reference: &str) -> PaymentPreference {
        PaymentPreference {
            id: Uuid::new_v4(),
            appointment_key: "a-1".to_string(),
            contact_key: "c-1".to_string(),
            preference_id: "pref-1".to_string(),
            checkout_url: "https://psp.test/checkout/pref-1".to_string(),
            amount_cents: 5000,
            status: status.to_string(),
            payment_reference: Some(reference.to_string()),
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn status_mismatch_is_reported() {
        let remote = remote("p1", "approved", 50.0);
        let local = local("pending", "p1");

        let discrepancy = classify(&remote, Some(&local)).unwrap();
        assert_eq!(discrepancy.payment_reference, "p1");
        assert_eq!(discrepancy.local_status, "pending");
        assert_eq!(discrepancy.remote_status, "approved");
        assert_eq!(discrepancy.amount_cents, Some(5000));
    }

    #[test]
    fn missing_local_row_is_reported() {
        let remote = remote("p2", "approved", 12.34);

        let discrepancy = classify(&remote, None).unwrap();
        assert_eq!(discrepancy.local_status, LOCAL_STATUS_MISSING);
        assert_eq!(discrepancy.amount_cents, Some(1234));
    }

    #[test]
    fn matching_status_is_silent() {
        assert!(classify(&remote("p3", "pending", 10.0), Some(&local("pending", "p3"))).is_none());
    }

    #[test]
    fn local_paid_matches_remote_approved() {
        assert!(classify(&remote("p4", "approved", 10.0), Some(&local("paid", "p4"))).is_none());
    }

    #[test]
    fn report_record_is_flat() {
        let discrepancy = Discrepancy {
            payment_reference: "p1".to_string(),
            local_status: "pending".to_string(),
            remote_status: "approved".to_string(),
            amount_cents: Some(5000),
        };
        let value = serde_json::to_value(&discrepancy).unwrap();
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["amount_cents", "local_status", "payment_reference", "remote_status"]
        );
    }
}
