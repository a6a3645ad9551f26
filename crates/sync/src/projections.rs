//! Local projections of remote entities.
//!
//! Each projection carries a stable local id and a nullable `external_id`
//! that becomes unique once the remote platform assigns it. Appointments are
//! owned by contacts (cascade delete); payment preferences correlate to
//! appointments and contacts by string key only, because their webhooks can
//! arrive before the appointment row exists.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SyncResult;

/// Terminal status for a payment preference. Absorbing: once set it is never
/// downgraded by later events.
pub const PAID_STATUS: &str = "paid";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Contact {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tenant_key: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Appointment {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub contact_id: Uuid,
    pub tenant_key: Option<String>,
    pub calendar_id: Option<String>,
    pub title: Option<String>,
    pub status: String,
    pub assigned_user_id: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub source: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentPreference {
    pub id: Uuid,
    pub appointment_key: String,
    pub contact_key: String,
    pub preference_id: String,
    pub checkout_url: String,
    pub amount_cents: i64,
    pub status: String,
    pub payment_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Canonical contact fields extracted from a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactUpsert {
    pub external_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tenant_key: Option<String>,
}

/// Canonical appointment fields extracted from a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentUpsert {
    pub external_id: String,
    pub contact_external_id: Option<String>,
    pub tenant_key: Option<String>,
    pub calendar_id: Option<String>,
    pub title: Option<String>,
    pub status: String,
    pub assigned_user_id: Option<String>,
    pub notes: Option<String>,
    pub starts_at: Option<OffsetDateTime>,
    pub ends_at: Option<OffsetDateTime>,
    pub source: Option<String>,
}

const CONTACT_COLUMNS: &str = "id, external_id, first_name, last_name, email, phone, tenant_key, \
                               created_at, updated_at";

const APPOINTMENT_COLUMNS: &str = "id, external_id, contact_id, tenant_key, calendar_id, title, \
                                   status, assigned_user_id, notes, starts_at, ends_at, source, \
                                   created_at, updated_at";

const PREFERENCE_COLUMNS: &str = "id, appointment_key, contact_key, preference_id, checkout_url, \
                                  amount_cents, status, payment_reference, created_at, updated_at";

#[derive(Clone)]
pub struct ProjectionStore {
    pool: PgPool,
}

impl ProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_contact(&self, upsert: &ContactUpsert) -> SyncResult<Contact> {
        let contact: Contact = sqlx::query_as(&format!(
            r#"
            INSERT INTO contacts (id, external_id, first_name, last_name, email, phone, tenant_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id) DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                tenant_key = COALESCE(EXCLUDED.tenant_key, contacts.tenant_key),
                updated_at = NOW()
            RETURNING {CONTACT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&upsert.external_id)
        .bind(&upsert.first_name)
        .bind(&upsert.last_name)
        .bind(&upsert.email)
        .bind(&upsert.phone)
        .bind(&upsert.tenant_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(contact)
    }

    pub async fn find_contact_by_external_id(&self, external_id: &str) -> SyncResult<Option<Contact>> {
        let contact: Option<Contact> = sqlx::query_as(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }

    pub async fn upsert_appointment(
        &self,
        upsert: &AppointmentUpsert,
        contact_id: Uuid,
    ) -> SyncResult<Appointment> {
        let appointment: Appointment = sqlx::query_as(&format!(
            r#"
            INSERT INTO appointments
                (id, external_id, contact_id, tenant_key, calendar_id, title, status,
                 assigned_user_id, notes, starts_at, ends_at, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (external_id) DO UPDATE SET
                contact_id = EXCLUDED.contact_id,
                tenant_key = COALESCE(EXCLUDED.tenant_key, appointments.tenant_key),
                calendar_id = EXCLUDED.calendar_id,
                title = EXCLUDED.title,
                status = EXCLUDED.status,
                assigned_user_id = EXCLUDED.assigned_user_id,
                notes = EXCLUDED.notes,
                starts_at = EXCLUDED.starts_at,
                ends_at = EXCLUDED.ends_at,
                source = EXCLUDED.source,
                updated_at = NOW()
            RETURNING {APPOINTMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&upsert.external_id)
        .bind(contact_id)
        .bind(&upsert.tenant_key)
        .bind(&upsert.calendar_id)
        .bind(&upsert.title)
        .bind(&upsert.status)
        .bind(&upsert.assigned_user_id)
        .bind(&upsert.notes)
        .bind(upsert.starts_at)
        .bind(upsert.ends_at)
        .bind(&upsert.source)
        .fetch_one(&self.pool)
        .await?;

        Ok(appointment)
    }

    pub async fn insert_preference(
        &self,
        appointment_key: &str,
        contact_key: &str,
        preference_id: &str,
        checkout_url: &str,
        amount_cents: i64,
    ) -> SyncResult<PaymentPreference> {
        let preference: PaymentPreference = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_preferences
                (id, appointment_key, contact_key, preference_id, checkout_url, amount_cents)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PREFERENCE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(appointment_key)
        .bind(contact_key)
        .bind(preference_id)
        .bind(checkout_url)
        .bind(amount_cents)
        .fetch_one(&self.pool)
        .await?;

        Ok(preference)
    }

    pub async fn find_preference_by_appointment_key(
        &self,
        appointment_key: &str,
    ) -> SyncResult<Option<PaymentPreference>> {
        let preference: Option<PaymentPreference> = sqlx::query_as(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM payment_preferences \
             WHERE appointment_key = $1 ORDER BY created_at LIMIT 1"
        ))
        .bind(appointment_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(preference)
    }

    pub async fn find_preference_by_preference_id(
        &self,
        preference_id: &str,
    ) -> SyncResult<Option<PaymentPreference>> {
        let preference: Option<PaymentPreference> = sqlx::query_as(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM payment_preferences WHERE preference_id = $1"
        ))
        .bind(preference_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(preference)
    }

    pub async fn find_preference_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> SyncResult<Option<PaymentPreference>> {
        let preference: Option<PaymentPreference> = sqlx::query_as(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM payment_preferences WHERE payment_reference = $1"
        ))
        .bind(payment_reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(preference)
    }

    /// Atomically transition a preference into the terminal paid state.
    ///
    /// The payment reference and terminal status are set together in one
    /// conditional update; the guard makes concurrent duplicate deliveries
    /// race for a single winner. Returns the updated row for the winner and
    /// `None` for everyone else.
    pub async fn mark_preference_paid(
        &self,
        id: Uuid,
        payment_reference: &str,
    ) -> SyncResult<Option<PaymentPreference>> {
        let updated: Option<PaymentPreference> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_preferences
            SET payment_reference = $2, status = '{PAID_STATUS}', updated_at = NOW()
            WHERE id = $1 AND status <> '{PAID_STATUS}'
            RETURNING {PREFERENCE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(payment_reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    /// Record a non-terminal status. The guard keeps `paid` absorbing even
    /// when a stale "pending" arrives after the terminal event.
    pub async fn update_preference_status(&self, id: Uuid, status: &str) -> SyncResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE payment_preferences SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status <> '{PAID_STATUS}'"
        ))
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
