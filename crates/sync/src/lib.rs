// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! BridgePay Sync Engine
//!
//! Onboards a tenant into two independent platforms (a CRM and a PSP) and
//! keeps local projections of contacts, appointments, and payment
//! preferences consistent with both.
//!
//! ## Features
//!
//! - **Onboarding**: chained CRM → PSP OAuth flows stitched together by a
//!   single-use correlation token
//! - **Credentials**: per-tenant token records with refresh
//! - **Ingestion**: idempotent webhook processing tolerant of duplicate,
//!   delayed, and unordered deliveries
//! - **Payments**: checkout preference creation against the PSP
//! - **Dispatch**: best-effort CRM tagging after a payment completes
//! - **Reconciliation**: read-only diff of the local ledger against the PSP

pub mod config;
pub mod credentials;
pub mod crm;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod onboarding;
pub mod payments;
pub mod projections;
pub mod psp;
pub mod reconcile;

// Config
pub use config::{CrmConfig, PspConfig, ServiceSettings};

// Credentials
pub use credentials::{CredentialRecord, CredentialStore, Platform};

// Clients
pub use crm::{CrmClient, CrmTokenResponse};
pub use psp::{PspClient, PspTokenResponse, RemotePayment};

// Error
pub use error::{SyncError, SyncResult};

// Ingestion
pub use ingest::{EntityKind, IngestResult, WebhookIngestor};

// Onboarding
pub use onboarding::{CrmLegOutcome, OnboardingChain, OnboardingComplete};

// Payments
pub use payments::{CreatePreferenceRequest, PaymentService};

// Projections
pub use projections::{Appointment, Contact, PaymentPreference, ProjectionStore};

// Dispatch
pub use dispatch::SyncDispatcher;

// Reconciliation
pub use reconcile::{Discrepancy, ReconcileReport, ReconciliationEngine};

use sqlx::PgPool;

/// Main service combining every sync component, constructed once at startup
/// and shared by the HTTP handlers and the worker jobs.
pub struct SyncService {
    pub credentials: CredentialStore,
    pub onboarding: OnboardingChain,
    pub ingestor: WebhookIngestor,
    pub payments: PaymentService,
    pub dispatcher: SyncDispatcher,
    pub reconciliation: ReconciliationEngine,
}

impl SyncService {
    /// Create the service with explicit configuration.
    pub fn new(
        crm_config: CrmConfig,
        psp_config: PspConfig,
        settings: ServiceSettings,
        pool: PgPool,
    ) -> Self {
        let crm = CrmClient::new(crm_config);
        let psp = PspClient::new(psp_config);
        let credentials = CredentialStore::new(pool.clone(), crm.clone(), psp.clone());
        let projections = ProjectionStore::new(pool.clone());
        let dispatcher = SyncDispatcher::new(pool.clone(), crm.clone(), credentials.clone());

        Self {
            onboarding: OnboardingChain::new(pool, crm, psp.clone(), credentials.clone()),
            ingestor: WebhookIngestor::new(
                projections.clone(),
                credentials.clone(),
                psp.clone(),
                dispatcher.clone(),
            ),
            payments: PaymentService::new(
                projections.clone(),
                psp.clone(),
                credentials.clone(),
                settings.clone(),
            ),
            reconciliation: ReconciliationEngine::new(
                projections,
                credentials.clone(),
                psp,
                settings.report_dir,
            ),
            dispatcher,
            credentials,
        }
    }

    /// Create the service from environment variables.
    pub fn from_env(pool: PgPool) -> SyncResult<Self> {
        Ok(Self::new(
            CrmConfig::from_env()?,
            PspConfig::from_env()?,
            ServiceSettings::from_env()?,
            pool,
        ))
    }
}
