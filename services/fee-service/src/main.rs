//! Fee service HTTP server and event consumers.

use fee_service::Config;
use fee_service::app::Application;
use parkflow_runtime::metrics::PrometheusMetrics;
use parkflow_web::config::load_dotenv;
use parkflow_web::server::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let config = Config::from_env()?;
    init_tracing(&format!("fee_service={0},parkflow={0}", config.server.log_level));

    tracing::info!(
        address = %config.server.address(),
        broker = ?config.messaging.broker,
        user_service = %config.downstream.user_service_url,
        parking_service = %config.downstream.parking_service_url,
        monthly_fee = %config.monthly_fee,
        "Starting fee service"
    );

    let metrics = PrometheusMetrics::install()?;
    Application::build(config, metrics).await?.run().await
}
