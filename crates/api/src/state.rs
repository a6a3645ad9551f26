//! Application state

use std::sync::Arc;

use bridgepay_sync::SyncService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub sync: Arc<SyncService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, sync: SyncService) -> Self {
        Self {
            pool,
            config,
            sync: Arc::new(sync),
        }
    }
}
