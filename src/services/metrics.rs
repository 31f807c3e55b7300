use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, register_int_counter, CounterVec, Gauge, IntCounter};

lazy_static! {
    pub static ref TENANT_CONNECTIONS_GAUGE: Gauge = register_gauge!(
        "tenant_connections_active",
        "Tenant connection pools currently open in this process"
    ).unwrap();

    pub static ref PROVISIONING_COUNTER: CounterVec = register_counter_vec!(
        "tenant_provisioning_total",
        "Tenant provisioning operations by operation and status",
        &["operation", "status"]
    ).unwrap();

    pub static ref MIGRATIONS_APPLIED_COUNTER: IntCounter = register_int_counter!(
        "tenant_migrations_applied_total",
        "Schema migrations applied to tenant databases"
    ).unwrap();
}

/// Records the outcome of a provisioning operation.
pub fn record<T, E>(operation: &str, result: &Result<T, E>) {
    let status = if result.is_ok() { "ok" } else { "error" };
    PROVISIONING_COUNTER
        .with_label_values(&[operation, status])
        .inc();
}
