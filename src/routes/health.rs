use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

/// GET /health: open tenant connections plus the shared database, if any.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let registry = state.tenancy.registry();
    let active = registry.get_active_tenant_databases().await;
    let databases = registry.active_database_names().await;

    let Some(pool) = &state.directory else {
        return (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "tenant_connections": active,
                "tenant_databases": databases,
            })),
        );
    };

    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "db": "connected",
                "tenant_connections": active,
                "tenant_databases": databases,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "db": e.to_string(),
                "tenant_connections": active,
            })),
        ),
    }
}
