//! The tenancy surface used by the rest of the application.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, SchemaMode};
use crate::db::admin::{AdminClient, PgAdminClient};
use crate::db::registry::{PgTenantConnector, TenantConnector, TenantRegistry};
use crate::db::server_options;
use crate::error::Result;
use crate::models::tenant::{ProvisionReport, SeedReport, Tenant};
use crate::services::metrics;
use crate::services::migrator::TenantMigrator;
use crate::services::provisioner::{DatabaseStatus, TenantProvisioner};
use crate::services::seeder::{SeedSettings, TenantSeeder};

/// Schema and baseline data for one tenant database.
#[async_trait]
pub trait TenantSchema: Send + Sync {
    async fn run_migrations(&self, tenant: &Tenant) -> Result<usize>;
    async fn run_seeders(&self, tenant: &Tenant) -> Result<SeedReport>;
}

pub struct PgTenantSchema {
    pub migrator: TenantMigrator,
    pub seeder: TenantSeeder,
}

#[async_trait]
impl TenantSchema for PgTenantSchema {
    async fn run_migrations(&self, tenant: &Tenant) -> Result<usize> {
        self.migrator.run_migrations(tenant).await
    }

    async fn run_seeders(&self, tenant: &Tenant) -> Result<SeedReport> {
        self.seeder.run_seeders(tenant).await
    }
}

pub struct TenancyService<C: TenantConnector = PgTenantConnector> {
    provisioner: TenantProvisioner,
    registry: TenantRegistry<C>,
    schema: Arc<dyn TenantSchema>,
    schema_mode: SchemaMode,
}

impl TenancyService<PgTenantConnector> {
    pub fn from_config(config: &Config) -> Result<Self> {
        let server = server_options(&config.admin_database_url)?;
        let admin: Arc<dyn AdminClient> = Arc::new(PgAdminClient::from_config(config)?);
        let schema = PgTenantSchema {
            migrator: TenantMigrator::new(server.clone(), config.operation_timeout),
            seeder: TenantSeeder::new(
                server,
                config.operation_timeout,
                SeedSettings::from_config(config),
            ),
        };
        Ok(Self::new(
            TenantProvisioner::new(admin),
            TenantRegistry::from_config(config)?,
            Arc::new(schema),
            config.schema_mode,
        ))
    }
}

impl<C: TenantConnector> TenancyService<C> {
    pub fn new(
        provisioner: TenantProvisioner,
        registry: TenantRegistry<C>,
        schema: Arc<dyn TenantSchema>,
        schema_mode: SchemaMode,
    ) -> Self {
        Self {
            provisioner,
            registry,
            schema,
            schema_mode,
        }
    }

    pub fn registry(&self) -> &TenantRegistry<C> {
        &self.registry
    }

    /// Creates the database if needed, registers its connection, applies
    /// pending migrations and seeds baseline data. Every step is idempotent,
    /// so a failed run can simply be retried.
    pub async fn provision_tenant(&self, tenant: &Tenant) -> Result<ProvisionReport> {
        let res = self.provision(tenant).await;
        metrics::record("provision", &res);
        res
    }

    async fn provision(&self, tenant: &Tenant) -> Result<ProvisionReport> {
        let database_name = tenant.database_name()?.to_string();
        tracing::info!(tenant = %tenant.id, database = %database_name, "Provisioning tenant");

        let database_created = self.provisioner.create_tenant_database(tenant).await?;
        self.registry.create_tenant_database(tenant).await?;

        let migrations_applied = match self.schema_mode {
            SchemaMode::Migrate => self.schema.run_migrations(tenant).await?,
            SchemaMode::Synchronize => {
                tracing::debug!(database = %database_name, "Schema managed externally, skipping migrations");
                0
            }
        };
        let seed = self.schema.run_seeders(tenant).await?;

        tracing::info!(
            tenant = %tenant.id,
            database = %database_name,
            database_created,
            migrations_applied,
            "Tenant provisioned"
        );
        Ok(ProvisionReport {
            database_name,
            database_created,
            migrations_applied,
            seed,
        })
    }

    /// Provisions each tenant in turn once `assign_name` has given it a
    /// database name. A tenant that fails either step is logged and skipped.
    /// Returns how many were provisioned.
    pub async fn provision_all<F, Fut>(&self, tenants: Vec<Tenant>, assign_name: F) -> usize
    where
        F: Fn(Tenant) -> Fut,
        Fut: Future<Output = Result<Tenant>>,
    {
        let mut provisioned = 0;
        for tenant in tenants {
            let (id, subdomain) = (tenant.id, tenant.subdomain.clone());
            let tenant = match assign_name(tenant).await {
                Ok(tenant) => tenant,
                Err(e) => {
                    tracing::error!(tenant = %id, subdomain = %subdomain, "Failed to assign tenant database name: {e}");
                    continue;
                }
            };
            match self.provision_tenant(&tenant).await {
                Ok(_) => provisioned += 1,
                Err(e) => {
                    tracing::error!(tenant = %id, subdomain = %subdomain, "Failed to provision tenant: {e}");
                }
            }
        }
        provisioned
    }

    pub async fn get_tenant_connection(&self, database_name: &str) -> Result<C::Handle> {
        self.registry.get_tenant_data_source(database_name).await
    }

    /// Drops the tenant's database, then closes its registered connection.
    /// When the drop fails both the database and the connection are left
    /// untouched. Returns whether a database was dropped.
    ///
    /// The registered pool may reconnect between session termination and the
    /// drop, which makes the drop fail. Nothing is lost in that case and the
    /// call can be repeated.
    pub async fn deprovision_tenant(&self, tenant: &Tenant) -> Result<bool> {
        let res = self.deprovision(tenant).await;
        metrics::record("deprovision", &res);
        res
    }

    async fn deprovision(&self, tenant: &Tenant) -> Result<bool> {
        let database_name = tenant.database_name()?;
        let dropped = self.provisioner.drop_tenant_database(tenant).await?;
        self.registry.close_tenant_database(database_name).await;
        tracing::info!(tenant = %tenant.id, database = database_name, dropped, "Tenant deprovisioned");
        Ok(dropped)
    }

    pub async fn get_active_tenant_databases(&self) -> usize {
        self.registry.get_active_tenant_databases().await
    }

    pub async fn check_database_exists(&self, tenant: &Tenant) -> bool {
        self.provisioner.check_database_exists(tenant).await
    }

    pub async fn database_status(&self, tenant: &Tenant) -> DatabaseStatus {
        self.provisioner.database_status(tenant).await
    }

    /// Closes every tenant connection. Await once before the process exits.
    pub async fn shutdown(&self) {
        self.registry.close_all_databases().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::db::registry::testing::{FakeConnector, FakeHandle};
    use crate::db::registry::ConnectionHandle;
    use crate::error::TenancyError;
    use crate::models::tenant::test_tenant;
    use crate::services::provisioner::testing::FakeAdmin;

    const DB: &str = "school_greenfield_academy__abcd1234";

    /// Remembers which tenants were migrated and seeded, the way the real
    /// tables would.
    #[derive(Default)]
    struct FakeSchema {
        migrated: Mutex<Vec<String>>,
        seeded: Mutex<Vec<String>>,
        migrations: AtomicUsize,
        fail_seed: AtomicBool,
    }

    #[async_trait]
    impl TenantSchema for FakeSchema {
        async fn run_migrations(&self, tenant: &Tenant) -> Result<usize> {
            let name = tenant.database_name()?.to_string();
            let mut migrated = self.migrated.lock().unwrap();
            self.migrations.fetch_add(1, Ordering::SeqCst);
            if migrated.contains(&name) {
                return Ok(0);
            }
            migrated.push(name);
            Ok(4)
        }

        async fn run_seeders(&self, tenant: &Tenant) -> Result<SeedReport> {
            let name = tenant.database_name()?;
            if self.fail_seed.load(Ordering::SeqCst) {
                return Err(TenancyError::seeding(name, "relation \"roles\" does not exist"));
            }
            let mut seeded = self.seeded.lock().unwrap();
            let fresh = !seeded.iter().any(|n| n == name);
            seeded.push(name.to_string());
            let mut report = SeedReport::default();
            report.permissions.record(fresh);
            report.admins.record(fresh);
            Ok(report)
        }
    }

    struct Fixture {
        admin: Arc<FakeAdmin>,
        schema: Arc<FakeSchema>,
        service: TenancyService<FakeConnector>,
    }

    fn fixture(mode: SchemaMode) -> Fixture {
        let admin = Arc::new(FakeAdmin::default());
        let schema = Arc::new(FakeSchema::default());
        let service = TenancyService::new(
            TenantProvisioner::new(admin.clone()),
            TenantRegistry::new(FakeConnector::default()),
            schema.clone(),
            mode,
        );
        Fixture {
            admin,
            schema,
            service,
        }
    }

    #[tokio::test]
    async fn provisioning_twice_is_idempotent() {
        let f = fixture(SchemaMode::Migrate);
        let tenant = test_tenant("Greenfield Academy", DB);

        let first = f.service.provision_tenant(&tenant).await.unwrap();
        assert!(first.database_created);
        assert_eq!(first.migrations_applied, 4);
        assert_eq!(first.seed.created_total(), 2);

        let second = f.service.provision_tenant(&tenant).await.unwrap();
        assert!(!second.database_created);
        assert_eq!(second.migrations_applied, 0);
        assert_eq!(second.seed.created_total(), 0);

        assert_eq!(f.admin.count("create"), 1);
        assert_eq!(f.service.get_active_tenant_databases().await, 1);
        assert_eq!(f.service.registry().connector_opens(), 1);
    }

    #[tokio::test]
    async fn provisioned_connection_is_available() {
        let f = fixture(SchemaMode::Migrate);
        let tenant = test_tenant("Greenfield Academy", DB);

        assert!(matches!(
            f.service.get_tenant_connection(DB).await,
            Err(TenancyError::NotFound(_))
        ));
        f.service.provision_tenant(&tenant).await.unwrap();

        let handle: FakeHandle = f.service.get_tenant_connection(DB).await.unwrap();
        assert_eq!(handle.database, DB);
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn synchronize_mode_skips_migrations() {
        let f = fixture(SchemaMode::Synchronize);

        let report = f
            .service
            .provision_tenant(&test_tenant("Greenfield Academy", DB))
            .await
            .unwrap();

        assert_eq!(report.migrations_applied, 0);
        assert_eq!(f.schema.migrations.load(Ordering::SeqCst), 0);
        assert_eq!(f.schema.seeded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seeding_failure_surfaces_and_retry_recovers() {
        let f = fixture(SchemaMode::Migrate);
        let tenant = test_tenant("Greenfield Academy", DB);
        f.schema.fail_seed.store(true, Ordering::SeqCst);

        let err = f.service.provision_tenant(&tenant).await.unwrap_err();
        assert!(matches!(err, TenancyError::Seeding { .. }));
        assert!(f.admin.has(DB));

        f.schema.fail_seed.store(false, Ordering::SeqCst);
        let report = f.service.provision_tenant(&tenant).await.unwrap();
        assert!(!report.database_created);
        assert_eq!(f.admin.count("create"), 1);
    }

    #[tokio::test]
    async fn create_failure_registers_nothing() {
        let f = fixture(SchemaMode::Migrate);
        f.admin.fail_create.store(true, Ordering::SeqCst);

        let err = f
            .service
            .provision_tenant(&test_tenant("Greenfield Academy", DB))
            .await
            .unwrap_err();

        assert!(matches!(err, TenancyError::Provisioning { .. }));
        assert_eq!(f.service.get_active_tenant_databases().await, 0);
        assert!(f.schema.migrated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deprovision_drops_then_closes() {
        let f = fixture(SchemaMode::Migrate);
        let tenant = test_tenant("Greenfield Academy", DB);
        f.service.provision_tenant(&tenant).await.unwrap();
        let handle = f.service.get_tenant_connection(DB).await.unwrap();
        f.admin.attach_session(DB);

        assert!(f.service.deprovision_tenant(&tenant).await.unwrap());

        assert!(!f.admin.has(DB));
        assert!(handle.is_closed());
        assert_eq!(f.service.get_active_tenant_databases().await, 0);

        // Already gone: nothing left to drop.
        assert!(!f.service.deprovision_tenant(&tenant).await.unwrap());
    }

    #[tokio::test]
    async fn failed_drop_leaves_registry_entry() {
        let f = fixture(SchemaMode::Migrate);
        let tenant = test_tenant("Greenfield Academy", DB);
        f.service.provision_tenant(&tenant).await.unwrap();
        f.admin.fail_terminate.store(true, Ordering::SeqCst);

        let err = f.service.deprovision_tenant(&tenant).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(f.admin.has(DB));
        let handle = f.service.get_tenant_connection(DB).await.unwrap();
        assert!(!handle.is_closed());
        assert_eq!(f.service.get_active_tenant_databases().await, 1);
    }

    #[tokio::test]
    async fn reconnect_before_drop_fails_safely_and_retry_succeeds() {
        let f = fixture(SchemaMode::Migrate);
        let tenant = test_tenant("Greenfield Academy", DB);
        f.service.provision_tenant(&tenant).await.unwrap();
        f.admin.sessions_reappear.store(true, Ordering::SeqCst);

        let err = f.service.deprovision_tenant(&tenant).await.unwrap_err();

        assert!(matches!(err, TenancyError::Provisioning { .. }));
        assert!(f.admin.has(DB));
        let handle = f.service.get_tenant_connection(DB).await.unwrap();
        assert!(!handle.is_closed());

        f.admin.sessions_reappear.store(false, Ordering::SeqCst);
        assert!(f.service.deprovision_tenant(&tenant).await.unwrap());
        assert!(!f.admin.has(DB));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn provision_all_skips_failing_tenants() {
        let f = fixture(SchemaMode::Migrate);
        let mut unnamed = test_tenant("Pine", "school_pine_00000004");
        unnamed.database_name = None;
        let tenants = vec![
            test_tenant("Oak", "school_oak_00000001"),
            test_tenant("Elm", "school_elm_00000002"),
            unnamed,
            test_tenant("Ash", "school_ash_00000003"),
        ];

        let provisioned = f
            .service
            .provision_all(tenants, |tenant| async move {
                if tenant.name == "Elm" {
                    Err(TenancyError::Connectivity("tenant directory: connection reset".into()))
                } else {
                    Ok(tenant)
                }
            })
            .await;

        assert_eq!(provisioned, 2);
        assert_eq!(
            f.service.registry().active_database_names().await,
            vec!["school_ash_00000003", "school_oak_00000001"]
        );
        assert!(!f.admin.has("school_elm_00000002"));
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let f = fixture(SchemaMode::Migrate);
        let tenants = [
            test_tenant("Oak", "school_oak_00000001"),
            test_tenant("Elm", "school_elm_00000002"),
            test_tenant("Ash", "school_ash_00000003"),
        ];
        for tenant in &tenants {
            f.service.provision_tenant(tenant).await.unwrap();
        }
        assert_eq!(f.service.get_active_tenant_databases().await, 3);

        f.service.shutdown().await;

        assert_eq!(f.service.get_active_tenant_databases().await, 0);
        let opened = f.service.registry().opened_handles();
        assert_eq!(opened.len(), 3);
        assert!(opened.iter().all(|h| h.is_closed()));
    }

    #[tokio::test]
    async fn status_reports_through_the_provisioner() {
        let f = fixture(SchemaMode::Migrate);
        let tenant = test_tenant("Greenfield Academy", DB);

        assert_eq!(f.service.database_status(&tenant).await, DatabaseStatus::Absent);
        f.service.provision_tenant(&tenant).await.unwrap();
        assert!(f.service.check_database_exists(&tenant).await);

        f.admin.fail_exists.store(true, Ordering::SeqCst);
        assert_eq!(f.service.database_status(&tenant).await, DatabaseStatus::Unknown);
    }
}
