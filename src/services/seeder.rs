//! Baseline data for a freshly provisioned tenant database.
//!
//! Every record is looked up by its natural key before it is inserted, so the
//! whole sequence can be re-run after a partial failure.

use std::collections::HashMap;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{close_tenant_connection, open_tenant_connection};
use crate::error::{with_timeout, Result, TenancyError};
use crate::models::tenant::{SeedCounts, SeedReport, Tenant};

pub const SUPER_ADMIN_ROLE: &str = "super_admin";

pub const PERMISSIONS: &[(&str, &str)] = &[
    ("users.read", "View user accounts"),
    ("users.write", "Create, update and deactivate user accounts"),
    ("roles.read", "View roles and their permissions"),
    ("roles.write", "Manage roles and permission assignments"),
    ("units.read", "View organizational units"),
    ("units.write", "Manage organizational units"),
    ("students.read", "View student records"),
    ("students.write", "Manage student records"),
    ("classes.read", "View classes and timetables"),
    ("classes.write", "Manage classes and timetables"),
    ("grades.read", "View grades"),
    ("grades.write", "Record and edit grades"),
    ("attendance.read", "View attendance"),
    ("attendance.write", "Record attendance"),
    ("modules.manage", "Enable or disable feature modules"),
    ("settings.manage", "Manage school settings"),
];

pub enum Grants {
    All,
    Only(&'static [&'static str]),
}

pub struct RoleSeed {
    pub name: &'static str,
    pub description: &'static str,
    pub grants: Grants,
}

pub const ROLES: &[RoleSeed] = &[
    RoleSeed {
        name: SUPER_ADMIN_ROLE,
        description: "Full access to every school feature",
        grants: Grants::All,
    },
    RoleSeed {
        name: "school_admin",
        description: "Runs day-to-day school administration",
        grants: Grants::Only(&[
            "users.read",
            "users.write",
            "roles.read",
            "units.read",
            "students.read",
            "students.write",
            "classes.read",
            "classes.write",
            "grades.read",
            "attendance.read",
            "settings.manage",
        ]),
    },
    RoleSeed {
        name: "teacher",
        description: "Teaches classes and records results",
        grants: Grants::Only(&[
            "students.read",
            "classes.read",
            "grades.read",
            "grades.write",
            "attendance.read",
            "attendance.write",
        ]),
    },
    RoleSeed {
        name: "staff",
        description: "Front-office and support staff",
        grants: Grants::Only(&["students.read", "classes.read", "attendance.read"]),
    },
];

impl RoleSeed {
    fn permission_names(&self) -> Vec<&'static str> {
        match self.grants {
            Grants::All => PERMISSIONS.iter().map(|(name, _)| *name).collect(),
            Grants::Only(names) => names.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeedSettings {
    pub admin_email: String,
    pub admin_password: Option<String>,
    pub unit_code: String,
    pub unit_name: String,
}

impl SeedSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            admin_email: config.seed_admin_email.to_lowercase(),
            admin_password: config.seed_admin_password.clone(),
            unit_code: config.seed_unit_code.clone(),
            unit_name: config.seed_unit_name.clone(),
        }
    }
}

pub struct TenantSeeder {
    server: PgConnectOptions,
    timeout: Duration,
    settings: SeedSettings,
}

#[derive(Debug, thiserror::Error)]
enum SeedError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Hash(#[from] bcrypt::BcryptError),
    #[error("{0}")]
    Catalogue(String),
}

impl SeedError {
    fn into_tenancy(self, database: &str) -> TenancyError {
        match self {
            SeedError::Database(e) => {
                TenancyError::from_sqlx(e, |m| TenancyError::seeding(database, m))
            }
            other => TenancyError::seeding(database, other.to_string()),
        }
    }
}

impl TenantSeeder {
    pub fn new(server: PgConnectOptions, timeout: Duration, settings: SeedSettings) -> Self {
        Self {
            server,
            timeout,
            settings,
        }
    }

    /// Seeds permissions, roles, the default unit and the default
    /// administrator, in that order, inside one transaction.
    pub async fn run_seeders(&self, tenant: &Tenant) -> Result<SeedReport> {
        let name = tenant.database_name()?;
        let mut conn = open_tenant_connection(&self.server, name, self.timeout).await?;
        let res = with_timeout(self.timeout, "seed tenant database", async {
            seed(&mut conn, &self.settings)
                .await
                .map_err(|e| e.into_tenancy(name))
        })
        .await;
        close_tenant_connection(conn, name).await;

        let report = res.inspect_err(|e| {
            tracing::error!(database = name, "Tenant seeding failed: {e}");
        })?;
        tracing::info!(
            database = name,
            created = report.created_total(),
            "Seeded tenant database"
        );
        Ok(report)
    }
}

type SeedResult<T> = std::result::Result<T, SeedError>;

async fn seed(conn: &mut PgConnection, settings: &SeedSettings) -> SeedResult<SeedReport> {
    let mut report = SeedReport::default();
    let mut tx = conn.begin().await?;

    let permission_ids = seed_permissions(&mut tx, &mut report.permissions).await?;
    let role_ids = seed_roles(&mut tx, &permission_ids, &mut report).await?;
    let unit_id = seed_default_unit(&mut tx, settings, &mut report.units).await?;

    let super_admin = *role_ids
        .get(SUPER_ADMIN_ROLE)
        .ok_or_else(|| SeedError::Catalogue(format!("role {SUPER_ADMIN_ROLE} was not seeded")))?;
    report.generated_admin_password =
        seed_default_admin(&mut tx, settings, super_admin, unit_id, &mut report.admins).await?;

    tx.commit().await?;
    Ok(report)
}

async fn seed_permissions(
    conn: &mut PgConnection,
    counts: &mut SeedCounts,
) -> SeedResult<HashMap<&'static str, Uuid>> {
    let mut ids = HashMap::new();
    for (name, description) in PERMISSIONS {
        let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM permissions WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
        let id = match existing {
            Some(id) => id,
            None => {
                sqlx::query_scalar("INSERT INTO permissions (name, description) VALUES ($1, $2) RETURNING id")
                    .bind(name)
                    .bind(description)
                    .fetch_one(&mut *conn)
                    .await?
            }
        };
        counts.record(existing.is_none());
        ids.insert(*name, id);
    }
    Ok(ids)
}

async fn seed_roles(
    conn: &mut PgConnection,
    permission_ids: &HashMap<&'static str, Uuid>,
    report: &mut SeedReport,
) -> SeedResult<HashMap<&'static str, Uuid>> {
    let mut ids = HashMap::new();
    for role in ROLES {
        let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM roles WHERE name = $1")
            .bind(role.name)
            .fetch_optional(&mut *conn)
            .await?;
        let role_id = match existing {
            Some(id) => id,
            None => {
                sqlx::query_scalar(
                    "INSERT INTO roles (name, description, is_system) VALUES ($1, $2, TRUE) RETURNING id",
                )
                .bind(role.name)
                .bind(role.description)
                .fetch_one(&mut *conn)
                .await?
            }
        };
        report.roles.record(existing.is_none());

        for permission in role.permission_names() {
            let permission_id = permission_ids
                .get(permission)
                .ok_or_else(|| {
                    SeedError::Catalogue(format!("role {} grants unknown permission {permission}", role.name))
                })?;
            let linked: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM role_permissions WHERE role_id = $1 AND permission_id = $2)",
            )
            .bind(role_id)
            .bind(permission_id)
            .fetch_one(&mut *conn)
            .await?;
            if !linked {
                sqlx::query("INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2)")
                    .bind(role_id)
                    .bind(permission_id)
                    .execute(&mut *conn)
                    .await?;
            }
            report.role_permissions.record(!linked);
        }
        ids.insert(role.name, role_id);
    }
    Ok(ids)
}

async fn seed_default_unit(
    conn: &mut PgConnection,
    settings: &SeedSettings,
    counts: &mut SeedCounts,
) -> SeedResult<Uuid> {
    let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM organizational_units WHERE code = $1")
        .bind(&settings.unit_code)
        .fetch_optional(&mut *conn)
        .await?;
    let id = match existing {
        Some(id) => id,
        None => {
            sqlx::query_scalar("INSERT INTO organizational_units (code, name) VALUES ($1, $2) RETURNING id")
                .bind(&settings.unit_code)
                .bind(&settings.unit_name)
                .fetch_one(&mut *conn)
                .await?
        }
    };
    counts.record(existing.is_none());
    Ok(id)
}

/// Returns the generated password when the administrator was created without
/// a configured one.
async fn seed_default_admin(
    conn: &mut PgConnection,
    settings: &SeedSettings,
    role_id: Uuid,
    unit_id: Uuid,
    counts: &mut SeedCounts,
) -> SeedResult<Option<String>> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
        .bind(&settings.admin_email)
        .fetch_one(&mut *conn)
        .await?;
    counts.record(!exists);
    if exists {
        return Ok(None);
    }

    let (password, generated) = match &settings.admin_password {
        Some(p) => (p.clone(), false),
        None => (generate_password(), true),
    };
    let password_hash = bcrypt::hash(&password, 12)?;

    sqlx::query(
        "INSERT INTO users
           (email, password_hash, first_name, last_name, role_id, unit_id, force_password_change)
         VALUES ($1, $2, 'School', 'Administrator', $3, $4, $5)",
    )
    .bind(&settings.admin_email)
    .bind(&password_hash)
    .bind(role_id)
    .bind(unit_id)
    .bind(generated)
    .execute(&mut *conn)
    .await?;

    Ok(generated.then_some(password))
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}
