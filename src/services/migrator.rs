use std::time::Duration;

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgConnection;

use crate::db::{close_tenant_connection, open_tenant_connection};
use crate::error::{is_connectivity, with_timeout, Result, TenancyError};
use crate::models::tenant::Tenant;
use crate::services::metrics::MIGRATIONS_APPLIED_COUNTER;

/// Tenant schema, embedded at compile time from ./migrations/tenant/
pub static TENANT_MIGRATOR: Migrator = sqlx::migrate!("./migrations/tenant");

/// Versions of the embedded forward migrations, in application order.
pub fn known_versions() -> Vec<i64> {
    TENANT_MIGRATOR
        .iter()
        .filter(|m| m.migration_type.is_up_migration())
        .map(|m| m.version)
        .collect()
}

/// Versions in `known` that have not been applied, preserving order.
pub fn pending_versions(known: &[i64], applied: &[i64]) -> Vec<i64> {
    known
        .iter()
        .copied()
        .filter(|v| !applied.contains(v))
        .collect()
}

async fn applied_versions(conn: &mut PgConnection) -> std::result::Result<Vec<i64>, sqlx::Error> {
    let has_table: bool =
        sqlx::query_scalar("SELECT to_regclass('public._sqlx_migrations') IS NOT NULL")
            .fetch_one(&mut *conn)
            .await?;
    if !has_table {
        return Ok(Vec::new());
    }
    sqlx::query_scalar("SELECT version FROM public._sqlx_migrations WHERE success ORDER BY version")
        .fetch_all(&mut *conn)
        .await
}

/// Applies schema migrations to tenant databases over dedicated
/// connections, leaving the registry's shared pool untouched.
pub struct TenantMigrator {
    server: PgConnectOptions,
    timeout: Duration,
}

impl TenantMigrator {
    pub fn new(server: PgConnectOptions, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    /// Applies every pending migration in version order and returns how many
    /// ran. Stops at the first failure; migrations already applied stay applied.
    pub async fn run_migrations(&self, tenant: &Tenant) -> Result<usize> {
        let name = tenant.database_name()?;
        let mut conn = open_tenant_connection(&self.server, name, self.timeout).await?;
        let res = with_timeout(self.timeout, "migrate tenant database", migrate(&mut conn, name)).await;
        close_tenant_connection(conn, name).await;

        match &res {
            Ok(0) => tracing::debug!(database = name, "Tenant schema is up to date"),
            Ok(n) => tracing::info!(database = name, applied = n, "Applied tenant migrations"),
            Err(e) => tracing::error!(database = name, "Tenant migration failed: {e}"),
        }
        res
    }

    /// Returns `false` when the check itself fails, so a connectivity blip
    /// does not block normal operation.
    pub async fn needs_migration(&self, tenant: &Tenant) -> bool {
        match self.pending_migrations(tenant).await {
            Ok(pending) => !pending.is_empty(),
            Err(e) => {
                tracing::warn!(tenant = %tenant.id, "Could not check pending migrations: {e}");
                false
            }
        }
    }

    pub async fn pending_migrations(&self, tenant: &Tenant) -> Result<Vec<i64>> {
        let name = tenant.database_name()?;
        let mut conn = open_tenant_connection(&self.server, name, self.timeout).await?;
        let applied = with_timeout(self.timeout, "read applied migrations", async {
            applied_versions(&mut conn)
                .await
                .map_err(|e| TenancyError::from_sqlx(e, |m| TenancyError::migration(name, m)))
        })
        .await;
        close_tenant_connection(conn, name).await;

        Ok(pending_versions(&known_versions(), &applied?))
    }
}

/// Transport failures while a migration runs stay retryable; everything else
/// is a `Migration` error.
fn migrate_error(name: &str, err: MigrateError) -> TenancyError {
    match &err {
        MigrateError::Execute(e) | MigrateError::ExecuteMigration(e, _) if is_connectivity(e) => {
            TenancyError::Connectivity(format!("migrate {name}: {err}"))
        }
        _ => TenancyError::migration(name, err.to_string()),
    }
}

async fn migrate(conn: &mut PgConnection, name: &str) -> Result<usize> {
    let applied = applied_versions(conn)
        .await
        .map_err(|e| TenancyError::from_sqlx(e, |m| TenancyError::migration(name, m)))?;
    let pending = pending_versions(&known_versions(), &applied);

    TENANT_MIGRATOR
        .run_direct(&mut *conn)
        .await
        .map_err(|e| migrate_error(name, e))?;

    MIGRATIONS_APPLIED_COUNTER.inc_by(pending.len() as u64);
    Ok(pending.len())
}
