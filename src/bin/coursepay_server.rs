//! coursepay-server: the order/billing gRPC service.
//!
//! Hosts the four order RPCs over tonic with a health endpoint, backed by
//! the configured storage (SQLite by default) and the in-process event bus.

use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info};

use coursepay::bus::init_event_bus;
use coursepay::config::Config;
use coursepay::proto::order_service_server::OrderServiceServer;
use coursepay::services::OrderService;
use coursepay::storage::init_storage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    coursepay::utils::bootstrap::init_tracing();

    let config_path = coursepay::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting coursepay-server");

    let (catalog, orders) = init_storage(&config.storage).await?;
    info!(storage = %config.storage.storage_type, "Storage initialized");

    let bus = init_event_bus(&config.messaging).map_err(|e| e as Box<dyn std::error::Error>)?;
    info!(messaging = %config.messaging.messaging_type, "Event bus initialized");

    let service = OrderService::new(catalog, orders, bus);

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    let addr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(address = %addr, "Order service listening");

    Server::builder()
        .add_service(health_service)
        .add_service(OrderServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
