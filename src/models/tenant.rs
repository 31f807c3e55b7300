use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::naming::is_valid_database_name;
use crate::error::{Result, TenancyError};

/// A school organization. The record lives in the shared application
/// database; its data lives in the database named by `database_name`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub subdomain: String,
    /// Assigned at creation time and never changed afterwards.
    pub database_name: Option<String>,
    pub is_active: bool,
    pub settings: serde_json::Value,
    /// Snapshot of enabled feature modules, maintained elsewhere.
    pub modules: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// The tenant's physical database name, checked before it reaches any DDL.
    pub fn database_name(&self) -> Result<&str> {
        let name = self
            .database_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                TenancyError::provisioning(
                    "<unassigned>",
                    format!("tenant {} has no database name assigned", self.id),
                )
            })?;
        if !is_valid_database_name(name) {
            return Err(TenancyError::provisioning(
                name,
                "database name is not a legal identifier",
            ));
        }
        Ok(name)
    }
}

/// Outcome of the composite provisioning workflow.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub database_name: String,
    pub database_created: bool,
    pub migrations_applied: usize,
    pub seed: SeedReport,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SeedCounts {
    pub created: usize,
    pub existing: usize,
}

impl SeedCounts {
    pub fn record(&mut self, created: bool) {
        if created {
            self.created += 1;
        } else {
            self.existing += 1;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub permissions: SeedCounts,
    pub roles: SeedCounts,
    pub role_permissions: SeedCounts,
    pub units: SeedCounts,
    pub admins: SeedCounts,
    /// Set only when the administrator was created with a generated password.
    #[serde(skip_serializing)]
    pub generated_admin_password: Option<String>,
}

impl SeedReport {
    pub fn created_total(&self) -> usize {
        self.permissions.created
            + self.roles.created
            + self.role_permissions.created
            + self.units.created
            + self.admins.created
    }
}

#[cfg(test)]
pub(crate) fn test_tenant(name: &str, database_name: &str) -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: name.to_string(),
        subdomain: name.to_lowercase().replace(' ', "-"),
        database_name: Some(database_name.to_string()),
        is_active: true,
        settings: serde_json::json!({}),
        modules: serde_json::json!([]),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
