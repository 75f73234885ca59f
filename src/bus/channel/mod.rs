//! In-memory channel-based event bus for standalone mode.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Ideal for local development and testing without external dependencies.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use super::{EventBus, EventHandler, Result};
use crate::proto::OrderEventLog;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// In-memory event bus using a tokio broadcast channel.
///
/// Events are published to the channel and received by all subscribers.
pub struct ChannelEventBus {
    /// Broadcast sender for publishing events.
    sender: broadcast::Sender<Arc<OrderEventLog>>,
    /// Registered event handlers.
    handlers: Arc<RwLock<Vec<Box<dyn EventHandler>>>>,
    /// Flag indicating if consumer task is running.
    consuming: Arc<RwLock<bool>>,
}

impl ChannelEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        info!("Channel event bus initialized");

        Self {
            sender,
            handlers: Arc::new(RwLock::new(Vec::new())),
            consuming: Arc::new(RwLock::new(false)),
        }
    }

    /// Get a clone of the sender for creating linked subscribers.
    pub fn sender(&self) -> broadcast::Sender<Arc<OrderEventLog>> {
        self.sender.clone()
    }

    /// Create a new bus that shares the same channel.
    pub fn linked(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            consuming: Arc::new(RwLock::new(false)),
        }
    }

    async fn start_consuming_impl(&self) -> Result<()> {
        // Check if already consuming
        {
            let mut consuming = self.consuming.write().await;
            if *consuming {
                return Ok(());
            }
            *consuming = true;
        }

        let mut receiver = self.sender.subscribe();
        let handlers = self.handlers.clone();

        // Spawn consumer task
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        debug!(order_id = %event.order_id, "Received order event via channel");

                        let handlers_guard = handlers.read().await;
                        for handler in handlers_guard.iter() {
                            if let Err(e) = handler.handle(Arc::clone(&event)).await {
                                error!(error = %e, order_id = %event.order_id, "Handler failed");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        break;
                    }
                }
            }
        });

        info!("Channel consumer started");

        Ok(())
    }
}

impl Default for ChannelEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(order_id = %event.order_id))]
    async fn publish(&self, event: Arc<OrderEventLog>) -> Result<()> {
        // Send to channel (ignore error if no receivers)
        match self.sender.send(event) {
            Ok(receiver_count) => {
                debug!(receivers = receiver_count, "Published order event to channel");
            }
            Err(_) => {
                // No receivers, that's okay for publish-only scenarios
                debug!("Published order event (no receivers)");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, handler: Box<dyn EventHandler>) -> Result<()> {
        let count = {
            let mut handlers = self.handlers.write().await;
            handlers.push(handler);
            handlers.len()
        };

        info!(handler_count = count, "Handler subscribed to channel bus");

        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        self.start_consuming_impl().await
    }
}
