//! Composition root: storage, broker, consumers, downstream clients and HTTP.

use crate::api::{AppState, router};
use crate::config::{Config, DownstreamConfig};
use crate::consumers::{FeeIssuer, PaymentNotifier};
use crate::orchestrator::FeePaymentOrchestrator;
use anyhow::Context;
use async_trait::async_trait;
use parkflow_core::broker::Broker;
use parkflow_core::environment::{Clock, SystemClock};
use parkflow_core::store::{IdempotencyLedger, Outbox};
use parkflow_core::topology::{FEE_ASSIGNMENT_QUEUE, NOTIFICATION_QUEUE, Topology};
use parkflow_postgres::{PgFeeStore, schema};
use parkflow_runtime::client::{ReqwestTransport, Transport};
use parkflow_runtime::directory::{ParkingDirectoryClient, UserDirectoryClient};
use parkflow_runtime::health::HealthCheck;
use parkflow_runtime::metrics::PrometheusMetrics;
use parkflow_runtime::{
    ConfirmListener, ConsumerPool, EventPublisher, IdempotentHandler, MessageProcessor, ReconciliationSweep,
    ServiceClient,
};
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
            tracing::warn!("BROKER_KIND=memory: only events published by this process are consumed");
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

/// Typed clients for user-service and parking-service over one transport.
#[must_use]
pub fn downstream_clients(
    config: &DownstreamConfig,
    transport: &Arc<dyn Transport>,
) -> (UserDirectoryClient, ParkingDirectoryClient) {
    let users = ServiceClient::new(
        "user-service",
        config.user_service_url.clone(),
        Arc::clone(transport),
        config.breaker(),
        config.timeout(),
    );
    let parking = ServiceClient::new(
        "parking-service",
        config.parking_service_url.clone(),
        Arc::clone(transport),
        config.breaker(),
        config.timeout(),
    );
    (UserDirectoryClient::new(users), ParkingDirectoryClient::new(parking))
}

struct Readiness {
    store: PgFeeStore,
    payments: FeePaymentOrchestrator,
}

#[async_trait]
impl ReadinessProbe for Readiness {
    async fn checks(&self) -> Vec<HealthCheck> {
        let database = match self.store.ping().await {
            Ok(()) => HealthCheck::healthy("database"),
            Err(e) => HealthCheck::unhealthy("database", e.to_string()),
        };
        vec![
            database,
            HealthCheck::for_breaker(self.payments.users().inner().breaker()),
            HealthCheck::for_breaker(self.payments.parking().inner().breaker()),
        ]
    }
}

/// A fully wired fee service.
pub struct Application {
    listener: tokio::net::TcpListener,
    app: axum::Router,
    background: Vec<JoinHandle<()>>,
    shutdown: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Application {
    /// Connect everything and start consumers and background tasks.
    ///
    /// # Errors
    ///
    /// Fails if the database, broker or listener cannot be set up.
    pub async fn build(config: Config, metrics: PrometheusMetrics) -> anyhow::Result<Self> {
        let pool = parkflow_postgres::connect(&config.database.url, config.database.max_connections)
            .await
            .context("connecting to the fee database")?;
        schema::migrate(&pool, schema::FEE_SERVICE).await?;
        let store = PgFeeStore::new(pool);
        let outbox: Arc<dyn Outbox> = Arc::new(store.outbox());
        let ledger: Arc<dyn IdempotencyLedger> = Arc::new(store.clone());

        let broker = connect_broker(&config.messaging).await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let publisher = EventPublisher::new(Arc::clone(&broker), Arc::clone(&clock));

        let (shutdown, _) = broadcast::channel(1);
        let mut background = vec![
            ConfirmListener::new(broker.as_ref(), Some(Arc::clone(&outbox))).spawn(shutdown.subscribe()),
            ReconciliationSweep::new(Arc::clone(&outbox), publisher.clone(), Arc::clone(&clock))
                .with_interval(Duration::from_secs(config.messaging.outbox_sweep_interval))
                .with_grace(Duration::from_secs(config.messaging.outbox_grace))
                .spawn(shutdown.subscribe()),
        ];

        let handlers: [(&str, Arc<dyn IdempotentHandler>); 2] = [
            (FEE_ASSIGNMENT_QUEUE, Arc::new(FeeIssuer::new(config.monthly_fee))),
            (NOTIFICATION_QUEUE, Arc::new(PaymentNotifier)),
        ];
        for (queue, handler) in handlers {
            let processor = MessageProcessor::new(Arc::clone(&ledger), handler, Arc::clone(&clock));
            background.extend(
                ConsumerPool::new(Arc::clone(&broker), queue, processor)
                    .with_workers(config.messaging.consumer_workers)
                    .spawn(&shutdown),
            );
            tracing::info!(queue, workers = config.messaging.consumer_workers, "Consumers started");
        }

        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::default());
        let (users, parking) = downstream_clients(&config.downstream, &transport);
        let payments =
            FeePaymentOrchestrator::new(Arc::new(store.clone()), outbox, users, parking, publisher, clock);

        let ops = OpsState::new(
            "fee-service",
            env!("CARGO_PKG_VERSION"),
            Arc::new(Readiness {
                store: store.clone(),
                payments: payments.clone(),
            }),
        )
        .with_metrics(metrics);
        let app = router(AppState {
            fees: Arc::new(store),
            payments,
        })
        .merge(ops_router(ops));

        let listener = tokio::net::TcpListener::bind(config.server.address()).await?;

        Ok(Self {
            listener,
            app,
            background,
            shutdown,
            shutdown_timeout: config.server.shutdown_timeout(),
        })
    }

    /// Serve until a shutdown signal, then drain consumers and background tasks.
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
