//! Read access to tenant records in the shared application database.
//! The `tenants` table is owned by the registration workflow.

use sqlx::PgPool;
use uuid::Uuid;

use crate::db::naming::generate_database_name;
use crate::error::{Result, TenancyError};
use crate::models::tenant::Tenant;

const TENANT_COLUMNS: &str = "id, name, subdomain, database_name, is_active,
     COALESCE(settings, '{}'::jsonb) AS settings,
     COALESCE(modules, '[]'::jsonb) AS modules,
     created_at, updated_at";

fn directory_error(e: sqlx::Error) -> TenancyError {
    TenancyError::from_sqlx(e, |m| TenancyError::NotFound(format!("tenant directory: {m}")))
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Tenant> {
    sqlx::query_as::<_, Tenant>(&format!("SELECT {TENANT_COLUMNS} FROM public.tenants WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(directory_error)?
        .ok_or_else(|| TenancyError::NotFound(format!("tenant {id}")))
}

pub async fn find_by_subdomain(pool: &PgPool, subdomain: &str) -> Result<Tenant> {
    sqlx::query_as::<_, Tenant>(&format!(
        "SELECT {TENANT_COLUMNS} FROM public.tenants WHERE subdomain = $1"
    ))
    .bind(subdomain.to_lowercase())
    .fetch_optional(pool)
    .await
    .map_err(directory_error)?
    .ok_or_else(|| TenancyError::NotFound(format!("tenant '{subdomain}'")))
}

pub async fn list_active(pool: &PgPool) -> Result<Vec<Tenant>> {
    sqlx::query_as::<_, Tenant>(&format!(
        "SELECT {TENANT_COLUMNS} FROM public.tenants WHERE is_active = TRUE ORDER BY name"
    ))
    .fetch_all(pool)
    .await
    .map_err(directory_error)
}

/// Assigns a database name to a tenant that has none yet. A name that is
/// already set is never overwritten; the stored record is returned either way.
pub async fn ensure_database_name(pool: &PgPool, tenant: Tenant, prefix: &str) -> Result<Tenant> {
    if tenant.database_name.as_deref().is_some_and(|n| !n.is_empty()) {
        return Ok(tenant);
    }

    let name = generate_database_name(prefix, &tenant.name, &tenant.id.to_string());
    let updated = sqlx::query_as::<_, Tenant>(&format!(
        "UPDATE public.tenants
         SET database_name = $2, updated_at = NOW()
         WHERE id = $1 AND (database_name IS NULL OR database_name = '')
         RETURNING {TENANT_COLUMNS}"
    ))
    .bind(tenant.id)
    .bind(&name)
    .fetch_optional(pool)
    .await
    .map_err(directory_error)?;

    match updated {
        Some(t) => {
            tracing::info!(tenant = %t.id, database = %name, "Assigned tenant database name");
            Ok(t)
        }
        // Another writer assigned it first; reload.
        None => find_by_id(pool, tenant.id).await,
    }
}
