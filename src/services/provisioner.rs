//! Creates and drops tenant databases through the administrative client.
//!
//! Holds no connection state. The per-database lock table makes
//! check-then-create and terminate-then-drop critical sections, so a
//! concurrent request for the same database cannot slip in between steps.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::db::admin::AdminClient;
use crate::error::{Result, TenancyError};
use crate::models::tenant::Tenant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseStatus {
    Present,
    Absent,
    /// The catalog could not be queried.
    Unknown,
}

pub struct TenantProvisioner {
    admin: Arc<dyn AdminClient>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TenantProvisioner {
    pub fn new(admin: Arc<dyn AdminClient>) -> Self {
        Self {
            admin,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, database_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(database_name.to_string()).or_default())
    }

    /// Drops the lock entry once no other caller holds or awaits it.
    async fn release_lock(&self, database_name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(database_name)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(database_name);
        }
    }

    /// Creates the tenant's database unless it already exists, then grants the
    /// service role its privileges. The grant runs on every call so a run that
    /// failed between the two steps is completed by the retry.
    /// Returns whether this call created the database.
    pub async fn create_tenant_database(&self, tenant: &Tenant) -> Result<bool> {
        let name = tenant.database_name()?;
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let created = if self.admin.exists(name).await? {
            tracing::info!(tenant = %tenant.id, database = name, "Tenant database already exists, skipping creation");
            false
        } else {
            match self.admin.create(name).await {
                Ok(()) => true,
                Err(TenancyError::AlreadyExists(_)) => {
                    tracing::info!(database = name, "Tenant database was created concurrently");
                    false
                }
                Err(e) => {
                    tracing::error!(tenant = %tenant.id, database = name, "Tenant database creation failed: {e}");
                    return Err(e);
                }
            }
        };

        self.admin.grant_privileges(name).await.inspect_err(|e| {
            tracing::error!(tenant = %tenant.id, database = name, "Granting tenant database privileges failed: {e}");
        })?;
        Ok(created)
    }

    /// Drops the tenant's database if present. Other sessions are terminated
    /// first; a database with live sessions cannot be dropped.
    /// Returns whether this call dropped it.
    pub async fn drop_tenant_database(&self, tenant: &Tenant) -> Result<bool> {
        let name = tenant.database_name()?;
        let lock = self.lock_for(name).await;
        let res = {
            let _guard = lock.lock().await;
            self.terminate_and_drop(tenant, name).await
        };
        self.release_lock(name, lock).await;
        res
    }

    async fn terminate_and_drop(&self, tenant: &Tenant, name: &str) -> Result<bool> {
        if !self.admin.exists(name).await? {
            tracing::info!(tenant = %tenant.id, database = name, "Tenant database does not exist, nothing to drop");
            return Ok(false);
        }

        let terminated = self.admin.terminate_connections(name).await?;
        if terminated > 0 {
            tracing::info!(database = name, terminated, "Terminated sessions before drop");
        }
        self.admin.drop_database(name).await?;
        Ok(true)
    }

    /// Existence probe for status reporting. Failures are logged and reported
    /// as `false`; use `database_status` to tell them apart from absence.
    pub async fn check_database_exists(&self, tenant: &Tenant) -> bool {
        self.database_status(tenant).await == DatabaseStatus::Present
    }

    pub async fn database_status(&self, tenant: &Tenant) -> DatabaseStatus {
        let name = match tenant.database_name() {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(tenant = %tenant.id, "Cannot check tenant database: {e}");
                return DatabaseStatus::Unknown;
            }
        };
        match self.admin.exists(name).await {
            Ok(true) => DatabaseStatus::Present,
            Ok(false) => DatabaseStatus::Absent,
            Err(e) => {
                tracing::warn!(database = name, "Database existence check failed: {e}");
                DatabaseStatus::Unknown
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FakeAdmin;
    use super::*;
    use crate::models::tenant::test_tenant;

    const DB: &str = "school_greenfield_academy__abcd1234";

    fn provisioner(admin: &Arc<FakeAdmin>) -> TenantProvisioner {
        TenantProvisioner::new(admin.clone())
    }

    #[tokio::test]
    async fn create_twice_issues_one_create() {
        let admin = Arc::new(FakeAdmin::default());
        let provisioner = provisioner(&admin);
        let tenant = test_tenant("Greenfield Academy", DB);

        assert!(provisioner.create_tenant_database(&tenant).await.unwrap());
        assert!(!provisioner.create_tenant_database(&tenant).await.unwrap());

        assert_eq!(admin.count("create"), 1);
        assert!(admin.has(DB));
    }

    #[tokio::test]
    async fn failed_grant_is_completed_by_retry() {
        let admin = Arc::new(FakeAdmin::default());
        admin.fail_grant.store(true, Ordering::SeqCst);
        let provisioner = provisioner(&admin);
        let tenant = test_tenant("Greenfield Academy", DB);

        let err = provisioner.create_tenant_database(&tenant).await.unwrap_err();
        assert!(matches!(err, TenancyError::Provisioning { .. }));
        assert!(admin.has(DB));
        assert!(!admin.is_granted(DB));

        admin.fail_grant.store(false, Ordering::SeqCst);
        let created = provisioner.create_tenant_database(&tenant).await.unwrap();

        assert!(!created);
        assert!(admin.is_granted(DB));
        assert_eq!(admin.count("create"), 1);
        assert_eq!(admin.count("grant"), 2);
    }

    #[tokio::test]
    async fn concurrent_creates_are_serialized() {
        let admin = Arc::new(FakeAdmin::default());
        let provisioner = Arc::new(provisioner(&admin));
        let tenant = test_tenant("Greenfield Academy", DB);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let provisioner = provisioner.clone();
                let tenant = tenant.clone();
                tokio::spawn(async move { provisioner.create_tenant_database(&tenant).await })
            })
            .collect();
        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(admin.count("create"), 1);
    }

    #[tokio::test]
    async fn already_exists_from_create_counts_as_success() {
        let admin = Arc::new(FakeAdmin::default());
        admin.create_races.store(true, Ordering::SeqCst);
        let provisioner = provisioner(&admin);

        let created = provisioner
            .create_tenant_database(&test_tenant("Greenfield Academy", DB))
            .await
            .unwrap();

        assert!(!created);
        assert!(admin.has(DB));
    }

    #[tokio::test]
    async fn create_failure_propagates() {
        let admin = Arc::new(FakeAdmin::default());
        admin.fail_create.store(true, Ordering::SeqCst);
        let provisioner = provisioner(&admin);

        let err = provisioner
            .create_tenant_database(&test_tenant("Greenfield Academy", DB))
            .await
            .unwrap_err();

        assert!(matches!(err, TenancyError::Provisioning { .. }));
        assert!(!admin.has(DB));
        assert_eq!(admin.count("grant"), 0);
    }

    #[tokio::test]
    async fn failed_existence_check_never_triggers_create() {
        let admin = Arc::new(FakeAdmin::default());
        admin.fail_exists.store(true, Ordering::SeqCst);
        let provisioner = provisioner(&admin);

        let err = provisioner
            .create_tenant_database(&test_tenant("Greenfield Academy", DB))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(admin.count("create"), 0);
    }

    #[tokio::test]
    async fn drop_of_missing_database_is_a_noop() {
        let admin = Arc::new(FakeAdmin::default());
        let provisioner = provisioner(&admin);

        let dropped = provisioner
            .drop_tenant_database(&test_tenant("Greenfield Academy", DB))
            .await
            .unwrap();

        assert!(!dropped);
        assert_eq!(admin.calls(), vec![format!("exists:{DB}")]);
    }

    #[tokio::test]
    async fn drop_terminates_sessions_first() {
        let admin = Arc::new(FakeAdmin::with_database(DB));
        admin.attach_session(DB);
        admin.attach_session(DB);
        let provisioner = provisioner(&admin);

        let dropped = provisioner
            .drop_tenant_database(&test_tenant("Greenfield Academy", DB))
            .await
            .unwrap();

        assert!(dropped);
        assert!(!admin.has(DB));
        assert!(provisioner.locks.lock().await.is_empty());
        assert_eq!(
            admin.calls(),
            vec![
                format!("exists:{DB}"),
                format!("terminate:{DB}"),
                format!("drop:{DB}"),
            ]
        );
    }

    #[tokio::test]
    async fn lock_entry_survives_while_contended() {
        let admin = Arc::new(FakeAdmin::with_database(DB));
        let provisioner = provisioner(&admin);
        let tenant = test_tenant("Greenfield Academy", DB);

        let held = provisioner.lock_for(DB).await;
        provisioner.drop_tenant_database(&tenant).await.unwrap();
        assert!(provisioner.locks.lock().await.contains_key(DB));

        drop(held);
        provisioner.drop_tenant_database(&tenant).await.unwrap();
        assert!(provisioner.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn drop_without_terminate_fails_on_active_sessions() {
        let admin = FakeAdmin::with_database(DB);
        admin.attach_session(DB);

        assert!(admin.drop_database(DB).await.is_err());
        assert!(admin.has(DB));

        admin.terminate_connections(DB).await.unwrap();
        admin.drop_database(DB).await.unwrap();
        assert!(!admin.has(DB));
    }

    #[tokio::test]
    async fn status_distinguishes_unknown_from_absent() {
        let admin = Arc::new(FakeAdmin::with_database(DB));
        let provisioner = provisioner(&admin);
        let present = test_tenant("Greenfield Academy", DB);
        let absent = test_tenant("Other", "school_other_ffffffff");

        assert_eq!(provisioner.database_status(&present).await, DatabaseStatus::Present);
        assert_eq!(provisioner.database_status(&absent).await, DatabaseStatus::Absent);
        assert!(provisioner.check_database_exists(&present).await);

        admin.fail_exists.store(true, Ordering::SeqCst);
        assert_eq!(provisioner.database_status(&present).await, DatabaseStatus::Unknown);
        assert!(!provisioner.check_database_exists(&present).await);
    }
}
