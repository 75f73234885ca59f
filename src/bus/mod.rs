//! Event bus for order event delivery.
//!
//! This module contains:
//! - `EventBus` trait: delivery of committed order event logs
//! - `EventHandler` trait: for processing events
//! - Implementations: in-memory channel, mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::MessagingConfig;
use crate::proto::OrderEventLog;

#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;

#[cfg(feature = "channel")]
pub use channel::ChannelEventBus;
pub use mock::MockEventBus;

/// Routing key committed order event logs are published under.
pub const ORDER_EVENT_LOG_TOPIC: &str = "order-event-log.created";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe not supported for this bus type")]
    SubscribeNotSupported,
}

/// Handler for processing order event logs from the bus.
pub trait EventHandler: Send + Sync {
    /// Process one committed order event log.
    fn handle(
        &self,
        event: Arc<OrderEventLog>,
    ) -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

/// Interface for delivering committed order events to downstream consumers.
///
/// Delivery is at-least-once; consumers de-duplicate by `order_id`.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to consumers.
    ///
    /// The event is wrapped in Arc to enforce immutability during
    /// distribution. All consumers receive a zero-copy reference to the
    /// same immutable data.
    async fn publish(&self, event: Arc<OrderEventLog>) -> Result<()>;

    /// Subscribe to events.
    ///
    /// The handler will be called for each event received.
    async fn subscribe(&self, handler: Box<dyn EventHandler>) -> Result<()>;

    /// Start consuming messages (call after subscribe).
    async fn start_consuming(&self) -> Result<()>;
}

/// Initialize event bus based on configuration.
///
/// Returns the appropriate EventBus implementation based on messaging type.
pub fn init_event_bus(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn EventBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type.as_str() {
        "channel" => {
            #[cfg(feature = "channel")]
            {
                let bus = ChannelEventBus::new();
                info!(messaging_type = "channel", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err("Channel bus requires the 'channel' feature. Rebuild with --features channel"
                    .into())
            }
        }
        other => Err(format!("Unknown messaging type: {}", other).into()),
    }
}
