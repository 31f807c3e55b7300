use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, Executor, PgConnection};

use crate::config::Config;
use crate::db::naming::quote_ident;
use crate::db::server_options;
use crate::error::{with_timeout, Result, TenancyError};

/// SQLSTATE `duplicate_database`.
const DUPLICATE_DATABASE: &str = "42P04";

/// Data-definition operations against the server's administrative database.
///
/// Implementations must not hold a connection between calls: `CREATE DATABASE`
/// and `DROP DATABASE` refuse to run on a session carrying other state.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Returns `false` when the catalog has no such database.
    async fn exists(&self, database_name: &str) -> Result<bool>;

    /// Fails with `AlreadyExists` if another session created it first.
    async fn create(&self, database_name: &str) -> Result<()>;

    /// Grants the service role full privileges on the database. Repeatable.
    async fn grant_privileges(&self, database_name: &str) -> Result<()>;

    /// Ends every other session attached to the database and returns how many
    /// were terminated. The caller's own session is never targeted.
    async fn terminate_connections(&self, database_name: &str) -> Result<u64>;

    async fn drop_database(&self, database_name: &str) -> Result<()>;
}

pub struct PgAdminClient {
    options: PgConnectOptions,
    service_role: String,
    timeout: Duration,
}

impl PgAdminClient {
    pub fn new(options: PgConnectOptions, service_role: String, timeout: Duration) -> Self {
        Self {
            options,
            service_role,
            timeout,
        }
    }

    /// The service role defaults to the user the administrative URL logs in as.
    pub fn from_config(config: &Config) -> Result<Self> {
        let options = server_options(&config.admin_database_url)?;
        let service_role = config
            .service_role
            .clone()
            .unwrap_or_else(|| options.get_username().to_string());
        Ok(Self::new(options, service_role, config.operation_timeout))
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| TenancyError::Connectivity(format!("administrative connection: {e}")))
    }
}

async fn release(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        tracing::warn!("Failed to close administrative connection: {e}");
    }
}

#[async_trait]
impl AdminClient for PgAdminClient {
    async fn exists(&self, database_name: &str) -> Result<bool> {
        with_timeout(self.timeout, "database existence check", async {
            let mut conn = self.connect().await?;
            let res = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)",
            )
            .bind(database_name)
            .fetch_one(&mut conn)
            .await;
            release(conn).await;
            res.map_err(|e| {
                TenancyError::from_sqlx(e, |m| TenancyError::provisioning(database_name, m))
            })
        })
        .await
    }

    async fn create(&self, database_name: &str) -> Result<()> {
        with_timeout(self.timeout, "create database", async {
            let mut conn = self.connect().await?;
            let db = quote_ident(database_name);

            let created = conn
                .execute(sqlx::raw_sql(&format!("CREATE DATABASE {db}")))
                .await;
            release(conn).await;
            if let Err(e) = created {
                let duplicate = matches!(
                    &e,
                    sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(DUPLICATE_DATABASE)
                );
                return Err(if duplicate {
                    TenancyError::AlreadyExists(database_name.to_string())
                } else {
                    TenancyError::from_sqlx(e, |m| TenancyError::provisioning(database_name, m))
                });
            }

            tracing::info!(database = database_name, "Created tenant database");
            Ok(())
        })
        .await
    }

    async fn grant_privileges(&self, database_name: &str) -> Result<()> {
        with_timeout(self.timeout, "grant privileges", async {
            let mut conn = self.connect().await?;
            let granted = conn
                .execute(sqlx::raw_sql(&format!(
                    "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
                    quote_ident(database_name),
                    quote_ident(&self.service_role)
                )))
                .await;
            release(conn).await;
            granted.map_err(|e| {
                TenancyError::from_sqlx(e, |m| {
                    TenancyError::provisioning(database_name, format!("grant to {}: {m}", self.service_role))
                })
            })?;
            tracing::debug!(database = database_name, role = %self.service_role, "Granted tenant database privileges");
            Ok(())
        })
        .await
    }

    async fn terminate_connections(&self, database_name: &str) -> Result<u64> {
        with_timeout(self.timeout, "terminate sessions", async {
            let mut conn = self.connect().await?;
            let res = sqlx::query_scalar::<_, bool>(
                "SELECT pg_terminate_backend(pid)
                 FROM pg_stat_activity
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
            )
            .bind(database_name)
            .fetch_all(&mut conn)
            .await;
            release(conn).await;
            let terminated = res.map_err(|e| {
                TenancyError::from_sqlx(e, |m| TenancyError::provisioning(database_name, m))
            })?;
            Ok(terminated.into_iter().filter(|t| *t).count() as u64)
        })
        .await
    }

    async fn drop_database(&self, database_name: &str) -> Result<()> {
        with_timeout(self.timeout, "drop database", async {
            let mut conn = self.connect().await?;
            let res = conn
                .execute(sqlx::raw_sql(&format!("DROP DATABASE {}", quote_ident(database_name))))
                .await;
            release(conn).await;
            res.map_err(|e| {
                TenancyError::from_sqlx(e, |m| TenancyError::provisioning(database_name, m))
            })?;
            tracing::info!(database = database_name, "Dropped tenant database");
            Ok(())
        })
        .await
    }
}
