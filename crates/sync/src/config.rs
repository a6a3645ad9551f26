//! Provider and service configuration.
//!
//! Every component receives its configuration explicitly at construction;
//! nothing reads process globals after startup. Base URLs are injectable so
//! tests can point the clients at a local mock server.

use std::path::PathBuf;

use crate::error::{SyncError, SyncResult};

/// CRM (contact/calendar platform) OAuth and API settings.
#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Base for the browser-facing authorization redirect.
    pub auth_base_url: String,
    /// Base for token exchange and resource calls.
    pub api_base_url: String,
    /// Mandatory `Version` header value on CRM resource calls.
    pub api_version: String,
    pub scopes: String,
}

impl CrmConfig {
    pub fn from_env() -> SyncResult<Self> {
        Ok(Self {
            client_id: require("CRM_CLIENT_ID")?,
            client_secret: require("CRM_CLIENT_SECRET")?,
            redirect_uri: require("CRM_REDIRECT_URI")?,
            auth_base_url: var_or("CRM_AUTH_BASE_URL", "https://marketplace.gohighlevel.com"),
            api_base_url: var_or("CRM_API_BASE_URL", "https://services.leadconnectorhq.com"),
            api_version: var_or("CRM_API_VERSION", "2021-07-28"),
            scopes: var_or(
                "CRM_OAUTH_SCOPES",
                "contacts.readonly contacts.write calendars/events.write locations.readonly users.readonly",
            ),
        })
    }
}

/// PSP (payment processor) OAuth and API settings.
#[derive(Debug, Clone)]
pub struct PspConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_base_url: String,
    pub api_base_url: String,
}

impl PspConfig {
    pub fn from_env() -> SyncResult<Self> {
        Ok(Self {
            client_id: require("PSP_CLIENT_ID")?,
            client_secret: require("PSP_CLIENT_SECRET")?,
            redirect_uri: require("PSP_REDIRECT_URI")?,
            auth_base_url: var_or("PSP_AUTH_BASE_URL", "https://auth.mercadopago.com"),
            api_base_url: var_or("PSP_API_BASE_URL", "https://api.mercadopago.com"),
        })
    }
}

/// Settings shared by the payment and reconciliation services.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Public base URL of this deployment; used for checkout back URLs and
    /// the PSP notification URL.
    pub public_url: String,
    /// Directory where reconciliation reports are written.
    pub report_dir: PathBuf,
    /// Currency for checkout preferences.
    pub currency: String,
}

impl ServiceSettings {
    pub fn from_env() -> SyncResult<Self> {
        Ok(Self {
            public_url: require("APP_PUBLIC_URL")?,
            report_dir: PathBuf::from(var_or("RECONCILE_REPORT_DIR", "reports")),
            currency: var_or("PAYMENT_CURRENCY", "PEN"),
        })
    }
}

fn require(name: &str) -> SyncResult<String> {
    std::env::var(name).map_err(|_| SyncError::Config(format!("{name} is not set")))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
