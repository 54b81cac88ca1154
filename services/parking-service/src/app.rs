//! Composition root: wires storage, broker, publisher and HTTP.

use crate::api::{AppState, router};
use crate::assignment::AssignmentService;
use crate::config::Config;
use anyhow::Context;
use async_trait::async_trait;
use parkflow_core::broker::Broker;
use parkflow_core::environment::{Clock, SystemClock};
use parkflow_core::store::Outbox;
use parkflow_core::topology::Topology;
use parkflow_postgres::{PgAssignmentStore, schema};
use parkflow_runtime::client::ReqwestTransport;
use parkflow_runtime::directory::UserDirectoryClient;
use parkflow_runtime::health::HealthCheck;
use parkflow_runtime::metrics::PrometheusMetrics;
use parkflow_runtime::{CircuitBreakerConfig, ConfirmListener, EventPublisher, ReconciliationSweep, ServiceClient};
use parkflow_web::config::{BrokerKind, MessagingConfig};
use parkflow_web::server::{drain, serve};
use parkflow_web::{OpsState, ReadinessProbe, ops_router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Connect the configured broker and declare the parking topology.
///
/// # Errors
///
/// Fails if the broker cannot be built, the topology is rejected, or
/// `redpanda` is requested from a binary built without that feature.
pub async fn connect_broker(config: &MessagingConfig) -> anyhow::Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match config.broker {
        BrokerKind::Memory => {
            tracing::warn!("BROKER_KIND=memory: events stay inside this process and reach no other service");
            Arc::new(parkflow_testing::InMemoryBroker::new())
        }
        #[cfg(feature = "redpanda")]
        BrokerKind::Redpanda => Arc::new(
            parkflow_redpanda::RedpandaBroker::builder()
                .brokers(config.brokers.clone())
                .build()?,
        ),
        #[cfg(not(feature = "redpanda"))]
        BrokerKind::Redpanda => anyhow::bail!("BROKER_KIND=redpanda requires the `redpanda` feature"),
    };

    broker
        .declare(&Topology::parking(config.max_delivery_attempts))
        .await
        .context("declaring broker topology")?;
    Ok(broker)
}

struct Readiness {
    store: PgAssignmentStore,
    users: UserDirectoryClient,
}

#[async_trait]
impl ReadinessProbe for Readiness {
    async fn checks(&self) -> Vec<HealthCheck> {
        let database = match self.store.ping().await {
            Ok(()) => HealthCheck::healthy("database"),
            Err(e) => HealthCheck::unhealthy("database", e.to_string()),
        };
        vec![database, HealthCheck::for_breaker(self.users.inner().breaker())]
    }
}

/// A fully wired parking service.
pub struct Application {
    listener: tokio::net::TcpListener,
    app: axum::Router,
    background: Vec<JoinHandle<()>>,
    shutdown: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Application {
    /// Connect everything and start the background tasks.
    ///
    /// # Errors
    ///
    /// Fails if the database, broker or listener cannot be set up.
    pub async fn build(config: Config, metrics: PrometheusMetrics) -> anyhow::Result<Self> {
        let pool = parkflow_postgres::connect(&config.database.url, config.database.max_connections)
            .await
            .context("connecting to the parking database")?;
        schema::migrate(&pool, schema::PARKING_SERVICE).await?;
        let store = PgAssignmentStore::new(pool);
        let outbox: Arc<dyn Outbox> = Arc::new(store.outbox());

        let broker = connect_broker(&config.messaging).await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let publisher = EventPublisher::new(Arc::clone(&broker), Arc::clone(&clock));

        let users = UserDirectoryClient::new(ServiceClient::new(
            "user-service",
            config.user_service_url.clone(),
            Arc::new(ReqwestTransport::default()),
            CircuitBreakerConfig::default(),
            config.downstream_timeout(),
        ));

        let (shutdown, _) = broadcast::channel(1);
        let background = vec![
            ConfirmListener::new(broker.as_ref(), Some(Arc::clone(&outbox))).spawn(shutdown.subscribe()),
            ReconciliationSweep::new(Arc::clone(&outbox), publisher.clone(), Arc::clone(&clock))
                .with_interval(Duration::from_secs(config.messaging.outbox_sweep_interval))
                .with_grace(Duration::from_secs(config.messaging.outbox_grace))
                .spawn(shutdown.subscribe()),
        ];

        let assignments = AssignmentService::new(Arc::new(store.clone()), outbox, users.clone(), publisher, clock);
        let ops = OpsState::new("parking-service", env!("CARGO_PKG_VERSION"), Arc::new(Readiness { store, users }))
            .with_metrics(metrics);
        let app = router(AppState { assignments }).merge(ops_router(ops));

        let listener = tokio::net::TcpListener::bind(config.server.address()).await?;

        Ok(Self {
            listener,
            app,
            background,
            shutdown,
            shutdown_timeout: config.server.shutdown_timeout(),
        })
    }

    /// Serve until a shutdown signal, then stop the background tasks.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that stopped the server.
    pub async fn run(self) -> anyhow::Result<()> {
        serve(self.listener, self.app, &self.shutdown).await?;
        drain(self.background, self.shutdown_timeout).await;
        Ok(())
    }
}
