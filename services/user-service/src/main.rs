//! User service HTTP server.

use anyhow::Context;
use async_trait::async_trait;
use parkflow_postgres::{PgOwnerDirectory, schema};
use parkflow_runtime::health::HealthCheck;
use parkflow_runtime::metrics::PrometheusMetrics;
use parkflow_web::config::load_dotenv;
use parkflow_web::server::{drain, init_tracing, serve};
use parkflow_web::{OpsState, ReadinessProbe, ops_router};
use std::sync::Arc;
use tokio::sync::broadcast;
use user_service::{AppState, Config, router};

struct Readiness {
    owners: PgOwnerDirectory,
}

#[async_trait]
impl ReadinessProbe for Readiness {
    async fn checks(&self) -> Vec<HealthCheck> {
        vec![match self.owners.ping().await {
            Ok(()) => HealthCheck::healthy("database"),
            Err(e) => HealthCheck::unhealthy("database", e.to_string()),
        }]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let config = Config::from_env()?;
    init_tracing(&format!("user_service={0},parkflow={0}", config.server.log_level));

    tracing::info!(address = %config.server.address(), "Starting user service");
    let metrics = PrometheusMetrics::install()?;

    let pool = parkflow_postgres::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to the owner database")?;
    schema::migrate(&pool, schema::USER_SERVICE).await?;
    let owners = PgOwnerDirectory::new(pool);

    let ops = OpsState::new("user-service", env!("CARGO_PKG_VERSION"), Arc::new(Readiness { owners: owners.clone() }))
        .with_metrics(metrics);
    let app = router(AppState::new(Arc::new(owners))).merge(ops_router(ops));

    let (shutdown, _) = broadcast::channel(1);
    let listener = tokio::net::TcpListener::bind(config.server.address()).await?;
    serve(listener, app, &shutdown).await?;
    drain(Vec::new(), config.server.shutdown_timeout()).await;
    Ok(())
}
