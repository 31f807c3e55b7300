// Library exports for binary tools and tests
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use sqlx::PgPool;

use config::Config;
use services::tenancy::TenancyService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub tenancy: Arc<TenancyService>,
    /// Shared application database, when `DATABASE_URL` is configured.
    pub directory: Option<PgPool>,
    pub config: Arc<Config>,
}
