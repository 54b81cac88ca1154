//! Parking service HTTP server.

use parking_service::Config;
use parking_service::app::Application;
use parkflow_runtime::metrics::PrometheusMetrics;
use parkflow_web::config::load_dotenv;
use parkflow_web::server::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let config = Config::from_env()?;
    init_tracing(&format!("parking_service={0},parkflow={0}", config.server.log_level));

    tracing::info!(
        address = %config.server.address(),
        broker = ?config.messaging.broker,
        user_service = %config.user_service_url,
        "Starting parking service"
    );

    let metrics = PrometheusMetrics::install()?;
    Application::build(config, metrics).await?.run().await
}
