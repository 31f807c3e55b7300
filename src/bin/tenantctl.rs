//! Operator tool for tenant databases.
//!
//! Usage:
//!   tenantctl provision <TENANT>
//!   tenantctl deprovision <TENANT> --yes
//!   tenantctl migrate [<TENANT> | --all]
//!   tenantctl seed <TENANT>
//!   tenantctl status [<TENANT>]
//!
//! <TENANT> is a tenant id or subdomain. Reads the same environment as the
//! API (ADMIN_DATABASE_URL, DATABASE_URL, TENANT_DB_PREFIX, ...); DATABASE_URL
//! is required here because tenants are looked up in the shared database.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tenancy_provisioner::config::Config;
use tenancy_provisioner::db;
use tenancy_provisioner::models::tenant::Tenant;
use tenancy_provisioner::services::migrator::TenantMigrator;
use tenancy_provisioner::services::provisioner::DatabaseStatus;
use tenancy_provisioner::services::seeder::{SeedSettings, TenantSeeder};
use tenancy_provisioner::services::tenancy::TenancyService;

#[derive(Parser)]
#[command(name = "tenantctl", about = "Provision and maintain tenant databases")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create, migrate and seed a tenant's database (safe to re-run)
    Provision { tenant: String },
    /// Terminate sessions and drop a tenant's database
    Deprovision {
        tenant: String,
        /// Confirm the drop; without it nothing is changed
        #[arg(long)]
        yes: bool,
    },
    /// Apply pending schema migrations
    Migrate {
        tenant: Option<String>,
        /// Migrate every active tenant
        #[arg(long, conflicts_with = "tenant")]
        all: bool,
    },
    /// Seed baseline data (safe to re-run)
    Seed { tenant: String },
    /// Show database and migration status (all active tenants if omitted)
    Status { tenant: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL required")?;
    let pool = db::create_pool(database_url)
        .await
        .context("Failed to connect to the shared database")?;
    let tenancy = TenancyService::from_config(&config)?;

    let res = run(args.command, &config, &pool, &tenancy).await;

    tenancy.shutdown().await;
    pool.close().await;
    res
}

async fn run(command: Command, config: &Config, pool: &PgPool, tenancy: &TenancyService) -> Result<()> {
    let server = db::server_options(&config.admin_database_url)?;
    let migrator = TenantMigrator::new(server.clone(), config.operation_timeout);

    match command {
        Command::Provision { tenant } => {
            let tenant = resolve(pool, config, &tenant).await?;
            let report = tenancy.provision_tenant(&tenant).await?;

            println!("Provisioned {} ({})", tenant.subdomain, report.database_name);
            println!(
                "  database:   {}",
                if report.database_created { "created" } else { "already existed" }
            );
            println!("  migrations: {} applied", report.migrations_applied);
            println!("  seed:       {} record(s) created", report.seed.created_total());
            if let Some(password) = &report.seed.generated_admin_password {
                println!(
                    "  admin:      {} / {password}  (shown once, change at first login)",
                    config.seed_admin_email
                );
            }
        }
        Command::Deprovision { tenant, yes } => {
            let tenant = resolve(pool, config, &tenant).await?;
            let name = tenant.database_name()?;
            if !yes {
                bail!("Refusing to drop {name} without --yes");
            }
            if tenancy.deprovision_tenant(&tenant).await? {
                println!("Dropped {name}");
            } else {
                println!("{name} does not exist, nothing to drop");
            }
        }
        Command::Migrate { tenant, all } => {
            let tenants = match (tenant, all) {
                (Some(t), _) => vec![resolve(pool, config, &t).await?],
                (None, true) => active_tenants(pool, config).await?,
                (None, false) => bail!("Pass a tenant or --all"),
            };
            let mut failed = 0;
            for tenant in &tenants {
                match migrator.run_migrations(tenant).await {
                    Ok(n) => println!("{}: {n} migration(s) applied", tenant.subdomain),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {e}", tenant.subdomain);
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} tenant(s) failed to migrate", tenants.len());
            }
        }
        Command::Seed { tenant } => {
            let tenant = resolve(pool, config, &tenant).await?;
            let seeder = TenantSeeder::new(server, config.operation_timeout, SeedSettings::from_config(config));
            let report = seeder.run_seeders(&tenant).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(password) = &report.generated_admin_password {
                println!("Administrator {} created with password {password}", config.seed_admin_email);
            }
        }
        Command::Status { tenant } => {
            let tenants = match tenant {
                Some(t) => vec![resolve(pool, config, &t).await?],
                None => db::tenant::list_active(pool).await?,
            };
            for tenant in &tenants {
                let Some(name) = tenant.database_name.as_deref() else {
                    println!("{:<24} (no database assigned)", tenant.subdomain);
                    continue;
                };
                let status = tenancy.database_status(tenant).await;
                let pending = match status {
                    DatabaseStatus::Present => match migrator.pending_migrations(tenant).await {
                        Ok(p) => format!("{} pending migration(s)", p.len()),
                        Err(e) => format!("migrations unknown: {e}"),
                    },
                    _ => String::from("-"),
                };
                println!("{:<24} {:<40} {:<8} {pending}", tenant.subdomain, name, status_label(status));
            }
        }
    }
    Ok(())
}

fn status_label(status: DatabaseStatus) -> &'static str {
    match status {
        DatabaseStatus::Present => "present",
        DatabaseStatus::Absent => "absent",
        DatabaseStatus::Unknown => "unknown",
    }
}

/// Looks a tenant up by id or subdomain and makes sure it has a database name.
async fn resolve(pool: &PgPool, config: &Config, selector: &str) -> Result<Tenant> {
    let tenant = match selector.parse::<Uuid>() {
        Ok(id) => db::tenant::find_by_id(pool, id).await?,
        Err(_) => db::tenant::find_by_subdomain(pool, selector).await?,
    };
    Ok(db::tenant::ensure_database_name(pool, tenant, &config.database_name_prefix).await?)
}

async fn active_tenants(pool: &PgPool, config: &Config) -> Result<Vec<Tenant>> {
    let mut tenants = Vec::new();
    for tenant in db::tenant::list_active(pool).await? {
        tenants.push(db::tenant::ensure_database_name(pool, tenant, &config.database_name_prefix).await?);
    }
    Ok(tenants)
}
