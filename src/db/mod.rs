pub mod admin;
pub mod naming;
pub mod registry;
pub mod tenant;

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};

use crate::error::{with_timeout, Result, TenancyError};

/// Pool over the shared application database (tenant directory).
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Parses the administrative URL. Tenant connections reuse its host,
/// credentials and TLS settings with only the database swapped.
pub fn server_options(admin_database_url: &str) -> Result<PgConnectOptions> {
    PgConnectOptions::from_str(admin_database_url)
        .map_err(|e| TenancyError::Config(format!("ADMIN_DATABASE_URL: {e}")))
}

pub fn tenant_options(server: &PgConnectOptions, database_name: &str) -> PgConnectOptions {
    server.clone().database(database_name)
}

/// Opens a single short-lived connection to a tenant database, used for
/// schema changes and seeding so the shared pool is never held for them.
pub async fn open_tenant_connection(
    server: &PgConnectOptions,
    database_name: &str,
    timeout: Duration,
) -> Result<PgConnection> {
    let options = tenant_options(server, database_name);
    with_timeout(timeout, "tenant connection", async {
        PgConnection::connect_with(&options).await.map_err(|e| {
            TenancyError::Connectivity(format!("connect to {database_name}: {e}"))
        })
    })
    .await
}

pub async fn close_tenant_connection(conn: PgConnection, database_name: &str) {
    if let Err(e) = conn.close().await {
        tracing::warn!(database = database_name, "Failed to close tenant connection: {e}");
    }
}
