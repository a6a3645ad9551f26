//! BridgePay API Library
//!
//! HTTP surface for onboarding callbacks, inbound webhooks, checkout
//! preference creation, and manual reconciliation runs.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
