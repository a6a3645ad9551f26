//! Inbound webhook ingestion.
//!
//! Both platforms deliver unordered, duplicated, and occasionally malformed
//! events. Normalization into one canonical event type per platform is pure
//! and shape-tolerant; idempotency and the absorbing terminal status are
//! enforced against persisted state, never against event sequence, so
//! redelivery and reordering are the expected case rather than an edge case.

use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credentials::{CredentialRecord, CredentialStore, Platform};
use crate::dispatch::SyncDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::projections::{
    AppointmentUpsert, ContactUpsert, PaymentPreference, ProjectionStore, PAID_STATUS,
};
use crate::psp::{amount_to_cents, PspClient, RemotePayment};

/// Outcome of ingesting one webhook delivery. Every variant is acknowledged
/// to the sender; none of them should trigger redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestResult {
    Applied {
        kind: EntityKind,
        external_id: String,
    },
    /// Duplicate delivery of an already-terminal payment event, or an event
    /// absorbed by the terminal status. No writes, no side-effects.
    AlreadyApplied { payment_reference: String },
    /// The event references an entity this system does not know. Not an
    /// error; state is untouched.
    NotFound { reference: String },
    /// No usable identifier in the payload. Acknowledged and dropped.
    Unresolvable { placeholder_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Contact,
    Appointment,
    Payment,
}

/// Canonical CRM event after shape-sniffing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CrmEvent {
    Contact(ContactUpsert),
    Appointment(AppointmentUpsert),
    Unresolvable { placeholder_id: String },
}

/// Canonical PSP event after shape-sniffing.
#[derive(Debug, Clone, PartialEq)]
enum PspEvent {
    /// Full payment object delivered inline.
    Payment(PaymentNotice),
    /// Thin `{id, type}` notification; the payment must be fetched.
    PaymentRef {
        payment_id: String,
        user_id: Option<String>,
    },
    Unresolvable { placeholder_id: String },
}

#[derive(Debug, Clone, PartialEq)]
struct PaymentNotice {
    payment_id: String,
    status: String,
    external_reference: Option<String>,
    preference_id: Option<String>,
    amount_cents: Option<i64>,
}

impl PaymentNotice {
    fn from_remote(remote: RemotePayment) -> Self {
        let preference_id = remote
            .metadata
            .as_ref()
            .and_then(|m| m.get("preference_id"))
            .and_then(json_id);
        Self {
            payment_id: remote.id,
            status: remote.status,
            external_reference: remote.external_reference,
            preference_id,
            amount_cents: remote.transaction_amount.map(amount_to_cents),
        }
    }
}

/// What to do with a payment event given the persisted preference state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PaymentTransition {
    /// First approval for this preference: set reference + terminal status.
    MarkPaid,
    /// Same reference, already terminal. Classic duplicate delivery.
    Duplicate,
    /// Terminal status absorbs the incoming event (e.g. stale "pending").
    IgnoreAbsorbed,
    /// Record a non-terminal provider status.
    UpdateStatus(String),
}

#[derive(Clone)]
pub struct WebhookIngestor {
    projections: ProjectionStore,
    credentials: CredentialStore,
    psp: PspClient,
    dispatcher: SyncDispatcher,
}

impl WebhookIngestor {
    pub fn new(
        projections: ProjectionStore,
        credentials: CredentialStore,
        psp: PspClient,
        dispatcher: SyncDispatcher,
    ) -> Self {
        Self {
            projections,
            credentials,
            psp,
            dispatcher,
        }
    }

    pub async fn ingest(&self, platform: Platform, payload: &Value) -> SyncResult<IngestResult> {
        match platform {
            Platform::Crm => self.ingest_crm(payload).await,
            Platform::Psp => self.ingest_psp(payload).await,
        }
    }

    async fn ingest_crm(&self, payload: &Value) -> SyncResult<IngestResult> {
        match normalize_crm(payload) {
            CrmEvent::Contact(upsert) => {
                self.projections.upsert_contact(&upsert).await?;
                tracing::info!(external_id = %upsert.external_id, "Contact projection upserted");
                Ok(IngestResult::Applied {
                    kind: EntityKind::Contact,
                    external_id: upsert.external_id,
                })
            }
            CrmEvent::Appointment(upsert) => {
                let Some(contact_external_id) = upsert.contact_external_id.clone() else {
                    tracing::warn!(
                        external_id = %upsert.external_id,
                        "Appointment event carries no contact id"
                    );
                    return Ok(IngestResult::NotFound {
                        reference: upsert.external_id,
                    });
                };
                let Some(contact) = self
                    .projections
                    .find_contact_by_external_id(&contact_external_id)
                    .await?
                else {
                    tracing::warn!(
                        contact_external_id = %contact_external_id,
                        "No contact projection for appointment event"
                    );
                    return Ok(IngestResult::NotFound {
                        reference: contact_external_id,
                    });
                };
                self.projections.upsert_appointment(&upsert, contact.id).await?;
                tracing::info!(external_id = %upsert.external_id, "Appointment projection upserted");
                Ok(IngestResult::Applied {
                    kind: EntityKind::Appointment,
                    external_id: upsert.external_id,
                })
            }
            CrmEvent::Unresolvable { placeholder_id } => {
                tracing::warn!(
                    placeholder_id = %placeholder_id,
                    "CRM event without usable identifier dropped"
                );
                Ok(IngestResult::Unresolvable { placeholder_id })
            }
        }
    }

    async fn ingest_psp(&self, payload: &Value) -> SyncResult<IngestResult> {
        match normalize_psp(payload) {
            PspEvent::Payment(notice) => self.apply_payment(notice).await,
            PspEvent::PaymentRef {
                payment_id,
                user_id,
            } => {
                let credential = self.psp_credential(user_id.as_deref()).await?;
                let remote = self
                    .credentials
                    .with_fresh_token(&credential, |token| {
                        let psp = self.psp.clone();
                        let payment_id = payment_id.clone();
                        async move { psp.fetch_payment(&token, &payment_id).await }
                    })
                    .await?;
                self.apply_payment(PaymentNotice::from_remote(remote)).await
            }
            PspEvent::Unresolvable { placeholder_id } => {
                tracing::warn!(
                    placeholder_id = %placeholder_id,
                    "PSP event without usable identifier dropped"
                );
                Ok(IngestResult::Unresolvable { placeholder_id })
            }
        }
    }

    /// Credential for the detail fetch: the event's `user_id` when present,
    /// otherwise the most recently connected PSP account.
    async fn psp_credential(&self, user_id: Option<&str>) -> SyncResult<CredentialRecord> {
        match user_id {
            Some(uid) => match self.credentials.get(Platform::Psp, uid).await {
                Ok(credential) => Ok(credential),
                Err(SyncError::CredentialNotFound { .. }) => {
                    self.credentials.latest(Platform::Psp).await
                }
                Err(e) => Err(e),
            },
            None => self.credentials.latest(Platform::Psp).await,
        }
    }

    async fn apply_payment(&self, notice: PaymentNotice) -> SyncResult<IngestResult> {
        let Some(preference) = self.correlate(&notice).await? else {
            let reference = notice
                .external_reference
                .clone()
                .unwrap_or_else(|| notice.payment_id.clone());
            tracing::warn!(reference = %reference, "No payment preference matches event");
            return Ok(IngestResult::NotFound { reference });
        };

        match decide_transition(
            &preference.status,
            preference.payment_reference.as_deref(),
            &notice.status,
            &notice.payment_id,
        ) {
            PaymentTransition::Duplicate => {
                tracing::info!(
                    payment_reference = %notice.payment_id,
                    "Duplicate payment delivery ignored"
                );
                Ok(IngestResult::AlreadyApplied {
                    payment_reference: notice.payment_id,
                })
            }
            PaymentTransition::IgnoreAbsorbed => {
                tracing::info!(
                    payment_reference = ?preference.payment_reference,
                    incoming_status = %notice.status,
                    "Terminal paid status absorbs incoming event"
                );
                Ok(IngestResult::AlreadyApplied {
                    payment_reference: notice.payment_id,
                })
            }
            PaymentTransition::MarkPaid => {
                match self
                    .projections
                    .mark_preference_paid(preference.id, &notice.payment_id)
                    .await?
                {
                    Some(updated) => {
                        tracing::info!(
                            payment_reference = %notice.payment_id,
                            amount_cents = ?notice.amount_cents,
                            "Payment approved; preference marked paid"
                        );
                        // Only the transition winner dispatches the CRM sync.
                        self.dispatcher.notify_paid(&updated.contact_key).await;
                        Ok(IngestResult::Applied {
                            kind: EntityKind::Payment,
                            external_id: notice.payment_id,
                        })
                    }
                    None => {
                        // A concurrent delivery won the conditional update.
                        tracing::info!(
                            payment_reference = %notice.payment_id,
                            "Lost paid transition to a concurrent delivery"
                        );
                        Ok(IngestResult::AlreadyApplied {
                            payment_reference: notice.payment_id,
                        })
                    }
                }
            }
            PaymentTransition::UpdateStatus(status) => {
                self.projections
                    .update_preference_status(preference.id, &status)
                    .await?;
                tracing::info!(
                    payment_reference = %notice.payment_id,
                    status = %status,
                    "Payment status recorded"
                );
                Ok(IngestResult::Applied {
                    kind: EntityKind::Payment,
                    external_id: notice.payment_id,
                })
            }
        }
    }

    async fn correlate(&self, notice: &PaymentNotice) -> SyncResult<Option<PaymentPreference>> {
        if let Some(key) = notice
            .external_reference
            .as_deref()
            .and_then(parse_appointment_key)
        {
            if let Some(preference) = self
                .projections
                .find_preference_by_appointment_key(key)
                .await?
            {
                return Ok(Some(preference));
            }
        }
        if let Some(preference_id) = notice.preference_id.as_deref() {
            return self
                .projections
                .find_preference_by_preference_id(preference_id)
                .await;
        }
        Ok(None)
    }
}

/// `appointment_<key>` correlation strings as produced at preference creation.
fn parse_appointment_key(external_reference: &str) -> Option<&str> {
    external_reference
        .strip_prefix("appointment_")
        .filter(|key| !key.is_empty())
}

fn decide_transition(
    current_status: &str,
    current_reference: Option<&str>,
    incoming_status: &str,
    payment_id: &str,
) -> PaymentTransition {
    let incoming_paid = matches!(incoming_status, "approved" | "paid");
    if current_status == PAID_STATUS {
        if incoming_paid && current_reference == Some(payment_id) {
            return PaymentTransition::Duplicate;
        }
        return PaymentTransition::IgnoreAbsorbed;
    }
    if incoming_paid {
        PaymentTransition::MarkPaid
    } else {
        PaymentTransition::UpdateStatus(incoming_status.to_string())
    }
}

fn normalize_crm(payload: &Value) -> CrmEvent {
    if let Some(node) = payload.get("appointment").filter(|v| v.is_object()) {
        return normalize_appointment(payload, node);
    }
    if payload.get("calendarId").is_some()
        || payload.get("startTime").is_some()
        || payload.get("appointmentStatus").is_some()
    {
        return normalize_appointment(payload, payload);
    }
    let node = payload
        .get("contact")
        .filter(|v| v.is_object())
        .unwrap_or(payload);
    normalize_contact(node)
}

fn normalize_contact(node: &Value) -> CrmEvent {
    let Some(external_id) = str_field(node, "id") else {
        return CrmEvent::Unresolvable {
            placeholder_id: placeholder(),
        };
    };
    CrmEvent::Contact(ContactUpsert {
        external_id,
        first_name: str_field(node, "firstName"),
        last_name: str_field(node, "lastName"),
        email: str_field(node, "email"),
        phone: str_field(node, "phone"),
        tenant_key: str_field(node, "locationId"),
    })
}

fn normalize_appointment(outer: &Value, node: &Value) -> CrmEvent {
    let Some(external_id) = pick(outer, node, "id") else {
        return CrmEvent::Unresolvable {
            placeholder_id: placeholder(),
        };
    };
    CrmEvent::Appointment(AppointmentUpsert {
        external_id,
        contact_external_id: pick(outer, node, "contactId"),
        tenant_key: pick(outer, node, "locationId"),
        calendar_id: pick(outer, node, "calendarId"),
        title: pick(outer, node, "title"),
        status: pick(outer, node, "appointmentStatus").unwrap_or_else(|| "confirmed".to_string()),
        assigned_user_id: pick(outer, node, "assignedUserId"),
        notes: pick(outer, node, "notes"),
        starts_at: parse_timestamp(pick(outer, node, "startTime")),
        ends_at: parse_timestamp(pick(outer, node, "endTime")),
        source: pick(outer, node, "source"),
    })
}

fn normalize_psp(payload: &Value) -> PspEvent {
    let payment_id = payload.get("id").and_then(json_id).or_else(|| {
        payload
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(json_id)
    });
    let Some(payment_id) = payment_id else {
        return PspEvent::Unresolvable {
            placeholder_id: placeholder(),
        };
    };

    let user_id = payload.get("user_id").and_then(json_id);

    match payload.get("status").and_then(|v| v.as_str()) {
        Some(status) => {
            let preference_id = str_field(payload, "preference_id").or_else(|| {
                payload
                    .get("metadata")
                    .and_then(|m| m.get("preference_id"))
                    .and_then(json_id)
            });
            PspEvent::Payment(PaymentNotice {
                payment_id,
                status: status.to_string(),
                external_reference: str_field(payload, "external_reference"),
                preference_id,
                amount_cents: payload
                    .get("transaction_amount")
                    .and_then(|v| v.as_f64())
                    .map(amount_to_cents),
            })
        }
        None => PspEvent::PaymentRef {
            payment_id,
            user_id,
        },
    }
}

fn placeholder() -> String {
    format!("unresolved-{}", Uuid::new_v4())
}

fn str_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Top-level field wins over the nested entity object.
fn pick(outer: &Value, node: &Value, key: &str) -> Option<String> {
    str_field(outer, key).or_else(|| {
        if std::ptr::eq(outer, node) {
            None
        } else {
            str_field(node, key)
        }
    })
}

fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: Option<String>) -> Option<OffsetDateTime> {
    value.and_then(|s| OffsetDateTime::parse(&s, &Rfc3339).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn crm_contact_nested_under_entity_key() {
        let payload = json!({
            "contact": {
                "id": "c-1",
                "firstName": "Ana",
                "lastName": "Lopez",
                "email": "ana@example.com",
                "locationId": "loc_123"
            }
        });

        match normalize_crm(&payload) {
            CrmEvent::Contact(upsert) => {
                assert_eq!(upsert.external_id, "c-1");
                assert_eq!(upsert.first_name.as_deref(), Some("Ana"));
                assert_eq!(upsert.tenant_key.as_deref(), Some("loc_123"));
            }
            other => panic!("expected contact event, got {other:?}"),
        }
    }

    #[test]
    fn crm_contact_top_level_shape() {
        let payload = json!({ "id": "c-2", "email": "b@example.com" });
        match normalize_crm(&payload) {
            CrmEvent::Contact(upsert) => {
                assert_eq!(upsert.external_id, "c-2");
                assert_eq!(upsert.email.as_deref(), Some("b@example.com"));
            }
            other => panic!("expected contact event, got {other:?}"),
        }
    }

    #[test]
    fn crm_appointment_nested_with_top_level_override() {
        let payload = json!({
            "id": "evt-outer",
            "appointment": {
                "id": "a-1",
                "contactId": "c-1",
                "calendarId": "cal-1",
                "appointmentStatus": "confirmed",
                "startTime": "2026-08-01T10:00:00Z"
            }
        });

        match normalize_crm(&payload) {
            CrmEvent::Appointment(upsert) => {
                // top-level id wins over the nested one
                assert_eq!(upsert.external_id, "evt-outer");
                assert_eq!(upsert.contact_external_id.as_deref(), Some("c-1"));
                assert!(upsert.starts_at.is_some());
            }
            other => panic!("expected appointment event, got {other:?}"),
        }
    }

    #[test]
    fn crm_appointment_top_level_shape() {
        let payload = json!({
            "id": "a-2",
            "calendarId": "cal-9",
            "contactId": "c-9",
            "startTime": "2026-08-01T10:00:00Z",
            "endTime": "not a timestamp"
        });

        match normalize_crm(&payload) {
            CrmEvent::Appointment(upsert) => {
                assert_eq!(upsert.external_id, "a-2");
                assert_eq!(upsert.status, "confirmed");
                assert!(upsert.starts_at.is_some());
                assert!(upsert.ends_at.is_none());
            }
            other => panic!("expected appointment event, got {other:?}"),
        }
    }

    #[test]
    fn crm_event_without_id_is_unresolvable() {
        let payload = json!({ "contact": { "firstName": "NoId" } });
        match normalize_crm(&payload) {
            CrmEvent::Unresolvable { placeholder_id } => {
                assert!(placeholder_id.starts_with("unresolved-"));
            }
            other => panic!("expected unresolvable, got {other:?}"),
        }
    }

    #[test]
    fn psp_full_payment_object() {
        let payload = json!({
            "id": 555,
            "status": "approved",
            "external_reference": "appointment_a-1",
            "transaction_amount": 50.0,
            "metadata": { "preference_id": "pref-1" }
        });

        match normalize_psp(&payload) {
            PspEvent::Payment(notice) => {
                assert_eq!(notice.payment_id, "555");
                assert_eq!(notice.status, "approved");
                assert_eq!(notice.external_reference.as_deref(), Some("appointment_a-1"));
                assert_eq!(notice.preference_id.as_deref(), Some("pref-1"));
                assert_eq!(notice.amount_cents, Some(5000));
            }
            other => panic!("expected payment notice, got {other:?}"),
        }
    }

    #[test]
    fn psp_thin_event_requires_detail_fetch() {
        let payload = json!({ "type": "payment", "data": { "id": 777 }, "user_id": 42 });
        match normalize_psp(&payload) {
            PspEvent::PaymentRef {
                payment_id,
                user_id,
            } => {
                assert_eq!(payment_id, "777");
                assert_eq!(user_id.as_deref(), Some("42"));
            }
            other => panic!("expected payment ref, got {other:?}"),
        }
    }

    #[test]
    fn psp_event_without_id_is_unresolvable() {
        let payload = json!({ "type": "payment" });
        assert!(matches!(
            normalize_psp(&payload),
            PspEvent::Unresolvable { .. }
        ));
    }

    #[test]
    fn appointment_key_round_trips() {
        assert_eq!(parse_appointment_key("appointment_a-12"), Some("a-12"));
        assert_eq!(parse_appointment_key("appointment_"), None);
        assert_eq!(parse_appointment_key("order_5"), None);
    }

    #[test]
    fn duplicate_paid_delivery_is_detected() {
        let transition = decide_transition("paid", Some("pay-1"), "approved", "pay-1");
        assert_eq!(transition, PaymentTransition::Duplicate);
    }

    #[test]
    fn pending_after_paid_is_absorbed() {
        let transition = decide_transition("paid", Some("pay-1"), "pending", "pay-1");
        assert_eq!(transition, PaymentTransition::IgnoreAbsorbed);
    }

    #[test]
    fn approval_with_different_reference_does_not_overwrite_terminal_state() {
        let transition = decide_transition("paid", Some("pay-1"), "approved", "pay-2");
        assert_eq!(transition, PaymentTransition::IgnoreAbsorbed);
    }

    #[test]
    fn first_approval_marks_paid() {
        let transition = decide_transition("pending", None, "approved", "pay-1");
        assert_eq!(transition, PaymentTransition::MarkPaid);
    }

    #[test]
    fn non_terminal_status_is_recorded() {
        let transition = decide_transition("pending", None, "in_process", "pay-1");
        assert_eq!(
            transition,
            PaymentTransition::UpdateStatus("in_process".to_string())
        );
    }

    #[test]
    fn ingest_result_serializes_with_tag() {
        let result = IngestResult::AlreadyApplied {
            payment_reference: "pay-1".to_string(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["result"], "already_applied");
        assert_eq!(value["payment_reference"], "pay-1");
    }
}
