use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenancy_provisioner::config::Config;
use tenancy_provisioner::services::tenancy::TenancyService;
use tenancy_provisioner::{db, routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let config = Arc::new(config);

    let tenancy = Arc::new(TenancyService::from_config(&config)?);

    let directory = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            info!("Tenant directory connected");
            provision_active_tenants(&tenancy, &pool, &config).await?;
            Some(pool)
        }
        None => {
            info!("DATABASE_URL not set, tenant connections are opened on demand only");
            None
        }
    };

    let state = AppState {
        tenancy: tenancy.clone(),
        directory,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Tenancy API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tenancy.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Re-provisions every active tenant (idempotent, safe on every startup) so
/// their connections are registered before traffic arrives.
async fn provision_active_tenants(
    tenancy: &TenancyService,
    pool: &sqlx::PgPool,
    config: &Config,
) -> anyhow::Result<()> {
    let tenants = db::tenant::list_active(pool).await?;
    let total = tenants.len();
    let prefix = config.database_name_prefix.as_str();
    let provisioned = tenancy
        .provision_all(tenants, |tenant| db::tenant::ensure_database_name(pool, tenant, prefix))
        .await;
    info!("{provisioned} of {total} active tenant(s) provisioned");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("Failed to listen for SIGTERM: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, closing tenant connections");
}
