//! Process-wide registry of long-lived tenant connection pools.
//!
//! One registry is built at startup and shared by reference. Each database
//! name maps to at most one open handle. The first caller for a name inserts
//! an empty slot under the write lock and opens the pool outside of it;
//! concurrent callers for the same name wait on that slot and share the
//! handle it produces instead of opening their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::{OnceCell, RwLock};

use crate::config::Config;
use crate::db::{server_options, tenant_options};
use crate::error::{with_timeout, Result, TenancyError};
use crate::models::tenant::Tenant;
use crate::services::metrics::TENANT_CONNECTIONS_GAUGE;

/// An open link to one tenant database that owns its own sockets.
#[async_trait]
pub trait ConnectionHandle: Clone + Send + Sync + 'static {
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
impl ConnectionHandle for PgPool {
    async fn close(&self) {
        PgPool::close(self).await
    }

    fn is_closed(&self) -> bool {
        PgPool::is_closed(self)
    }
}

/// Opens handles for the registry.
#[async_trait]
pub trait TenantConnector: Send + Sync + 'static {
    type Handle: ConnectionHandle;

    async fn open(&self, database_name: &str) -> Result<Self::Handle>;
}

pub struct PgTenantConnector {
    server: PgConnectOptions,
    max_connections: u32,
    timeout: Duration,
}

impl PgTenantConnector {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            server: server_options(&config.admin_database_url)?,
            max_connections: config.tenant_pool_max_connections,
            timeout: config.operation_timeout,
        })
    }
}

#[async_trait]
impl TenantConnector for PgTenantConnector {
    type Handle = PgPool;

    async fn open(&self, database_name: &str) -> Result<PgPool> {
        let options = tenant_options(&self.server, database_name);
        with_timeout(self.timeout, "open tenant pool", async {
            PgPoolOptions::new()
                .max_connections(self.max_connections)
                .acquire_timeout(self.timeout)
                .connect_with(options)
                .await
                .map_err(|e| TenancyError::Connectivity(format!("open pool for {database_name}: {e}")))
        })
        .await
    }
}

struct Slot<H> {
    handle: OnceCell<H>,
    /// Set when the entry is explicitly closed, so an open still in flight
    /// knows to discard its result.
    closed: AtomicBool,
}

impl<H> Slot<H> {
    fn new() -> Self {
        Self {
            handle: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }
}

enum Adoption {
    Registered,
    Closed,
    Superseded,
}

pub struct TenantRegistry<C: TenantConnector = PgTenantConnector> {
    connector: C,
    entries: RwLock<HashMap<String, Arc<Slot<C::Handle>>>>,
}

impl TenantRegistry<PgTenantConnector> {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(PgTenantConnector::from_config(config)?))
    }
}

impl<C: TenantConnector> TenantRegistry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a connection for the tenant's database, reusing the existing
    /// one if present.
    pub async fn create_tenant_database(&self, tenant: &Tenant) -> Result<C::Handle> {
        self.register(tenant.database_name()?).await
    }

    pub async fn register(&self, database_name: &str) -> Result<C::Handle> {
        loop {
            let slot = self.slot_for(database_name).await;
            if let Some(handle) = slot.handle.get() {
                return Ok(handle.clone());
            }

            let opened = AtomicBool::new(false);
            let (connector, opened_ref) = (&self.connector, &opened);
            let res = slot
                .handle
                .get_or_try_init(move || async move {
                    opened_ref.store(true, Ordering::SeqCst);
                    connector.open(database_name).await
                })
                .await;

            let handle = match res {
                Ok(handle) => handle.clone(),
                Err(e) => {
                    self.discard_failed(database_name, &slot).await;
                    tracing::warn!(database = database_name, "Failed to open tenant connection: {e}");
                    return Err(e);
                }
            };
            let opened_here = opened.load(Ordering::SeqCst);

            match self.adopt(database_name, &slot).await {
                Adoption::Registered => {
                    if opened_here {
                        tracing::info!(database = database_name, "Registered tenant connection");
                        self.refresh_gauge().await;
                    }
                    return Ok(handle);
                }
                Adoption::Closed => {
                    if opened_here {
                        handle.close().await;
                    }
                    return Err(TenancyError::Connectivity(format!(
                        "connection to {database_name} was closed while it was being opened"
                    )));
                }
                Adoption::Superseded => {
                    if opened_here {
                        handle.close().await;
                    }
                }
            }
        }
    }

    /// Returns the open handle for a database. Never opens one.
    pub async fn get_tenant_data_source(&self, database_name: &str) -> Result<C::Handle> {
        let entries = self.entries.read().await;
        entries
            .get(database_name)
            .and_then(|slot| slot.handle.get())
            .cloned()
            .ok_or_else(|| {
                TenancyError::NotFound(format!("no open connection for database {database_name}"))
            })
    }

    pub async fn close_tenant_database(&self, database_name: &str) {
        let slot = {
            let mut entries = self.entries.write().await;
            entries.remove(database_name)
        };
        let Some(slot) = slot else {
            return;
        };
        slot.closed.store(true, Ordering::SeqCst);

        if let Some(handle) = slot.handle.get() {
            if !handle.is_closed() {
                handle.close().await;
            }
            tracing::info!(database = database_name, "Closed tenant connection");
        }
        self.refresh_gauge().await;
    }

    /// Closes every registered handle concurrently and empties the registry.
    /// Call once during shutdown.
    pub async fn close_all_databases(&self) {
        let slots: Vec<(String, Arc<Slot<C::Handle>>)> = {
            let mut entries = self.entries.write().await;
            entries.drain().collect()
        };

        let handles: Vec<C::Handle> = slots
            .iter()
            .filter_map(|(_, slot)| {
                slot.closed.store(true, Ordering::SeqCst);
                slot.handle.get().cloned()
            })
            .collect();
        let count = handles.len();

        join_all(handles.iter().map(|h| h.close())).await;
        TENANT_CONNECTIONS_GAUGE.set(0.0);
        tracing::info!("Closed {count} tenant connection(s)");
    }

    pub async fn get_active_tenant_databases(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|s| s.handle.initialized()).count()
    }

    pub async fn active_database_names(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut names: Vec<String> = entries
            .iter()
            .filter(|(_, s)| s.handle.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the slot for `database_name`, inserting an empty one if absent.
    async fn slot_for(&self, database_name: &str) -> Arc<Slot<C::Handle>> {
        {
            let entries = self.entries.read().await;
            if let Some(slot) = entries.get(database_name) {
                return Arc::clone(slot);
            }
        }

        let mut entries = self.entries.write().await;
        Arc::clone(
            entries
                .entry(database_name.to_string())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    /// Decides whether a freshly initialized slot may be handed out.
    async fn adopt(&self, database_name: &str, slot: &Arc<Slot<C::Handle>>) -> Adoption {
        let mut entries = self.entries.write().await;
        if slot.closed.load(Ordering::SeqCst) {
            return Adoption::Closed;
        }
        match entries.get(database_name) {
            Some(current) if Arc::ptr_eq(current, slot) => Adoption::Registered,
            Some(_) => Adoption::Superseded,
            None => {
                // A failed peer discarded the slot before this caller's retry succeeded.
                entries.insert(database_name.to_string(), Arc::clone(slot));
                Adoption::Registered
            }
        }
    }

    async fn discard_failed(&self, database_name: &str, slot: &Arc<Slot<C::Handle>>) {
        let mut entries = self.entries.write().await;
        let is_current = entries
            .get(database_name)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if is_current && !slot.handle.initialized() {
            entries.remove(database_name);
        }
    }

    async fn refresh_gauge(&self) {
        let active = self.get_active_tenant_databases().await;
        TENANT_CONNECTIONS_GAUGE.set(active as f64);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use tokio::sync::Notify;

    use super::*;

    #[derive(Clone, Debug)]
    pub struct FakeHandle {
        pub id: usize,
        pub database: String,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ConnectionHandle for FakeHandle {
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Hands out numbered handles after an optional delay; can be told to
    /// fail the next N opens.
    #[derive(Default)]
    pub struct FakeConnector {
        pub opens: AtomicUsize,
        pub fail_next: AtomicUsize,
        pub delay: Duration,
        pub started: Arc<Notify>,
        pub handles: Mutex<Vec<FakeHandle>>,
    }

    impl FakeConnector {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        pub fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TenantConnector for FakeConnector {
        type Handle = FakeHandle;

        async fn open(&self, database_name: &str) -> Result<FakeHandle> {
            self.started.notify_one();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TenancyError::Connectivity(format!("refused: {database_name}")));
            }
            let id = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            let handle = FakeHandle {
                id,
                database: database_name.to_string(),
                closed: Arc::new(AtomicBool::new(false)),
            };
            self.handles.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }

    impl TenantRegistry<FakeConnector> {
        pub fn connector_opens(&self) -> usize {
            self.connector.open_count()
        }

        pub fn opened_handles(&self) -> Vec<FakeHandle> {
            self.connector.handles.lock().unwrap().clone()
        }
    }
}
