//! Event bus context
//!
//! One `EventBus` per process root replaces process-wide singletons: it owns
//! the configuration, at most one consumer and at most one supplier, and
//! shuts both down explicitly.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::admin::AdminResolver;
use crate::config::EventConfig;
use crate::consumer::EventConsumer;
use crate::error::{Error, Result};
use crate::supplier::EventSupplier;

/// Owner of the consumer and supplier of one process
pub struct EventBus {
    config: EventConfig,
    consumer: Mutex<Option<Arc<EventConsumer>>>,
    supplier: Mutex<Option<Arc<EventSupplier>>>,
}

impl EventBus {
    pub fn new(config: EventConfig) -> Self {
        Self {
            config,
            consumer: Mutex::new(None),
            supplier: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// Start the receiving side
    pub async fn start_consumer(&self, resolver: Arc<dyn AdminResolver>) -> Result<Arc<EventConsumer>> {
        let mut slot = self.consumer.lock().await;
        if slot.is_some() {
            return Err(Error::EventSystemFailed("consumer already started".into()));
        }
        let consumer = EventConsumer::start(self.config.clone(), resolver);
        *slot = Some(Arc::clone(&consumer));
        Ok(consumer)
    }

    /// Bind the publishing side for server `admin_name` and start its heartbeat
    pub async fn start_supplier(&self, admin_name: &str) -> Result<Arc<EventSupplier>> {
        let mut slot = self.supplier.lock().await;
        if slot.is_some() {
            return Err(Error::EventSystemFailed("supplier already started".into()));
        }
        let supplier = EventSupplier::start(self.config.clone(), admin_name).await?;
        supplier.push_heartbeat_event().await;
        supplier.spawn_heartbeat_task();
        *slot = Some(Arc::clone(&supplier));
        Ok(supplier)
    }

    pub async fn consumer(&self) -> Option<Arc<EventConsumer>> {
        self.consumer.lock().await.clone()
    }

    pub async fn supplier(&self) -> Option<Arc<EventSupplier>> {
        self.supplier.lock().await.clone()
    }

    /// Stop every task, disconnect every channel and close publisher sockets
    pub async fn shutdown(&self) {
        if let Some(consumer) = self.consumer.lock().await.take() {
            consumer.shutdown().await;
        }
        if let Some(supplier) = self.supplier.lock().await.take() {
            supplier.shutdown().await;
        }
        tracing::info!("Event bus shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::Directory;
    use crate::transport::NotifHub;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_single_consumer_and_supplier() {
        let bus = EventBus::new(EventConfig::notif(NotifHub::new()));
        let directory = Directory::new();

        assert_ok!(bus.start_consumer(directory.clone()).await);
        assert!(matches!(
            bus.start_consumer(directory).await,
            Err(Error::EventSystemFailed(_))
        ));

        let supplier = assert_ok!(bus.start_supplier("dserver/test/1").await);
        assert_eq!(supplier.stats().heartbeats_sent, 1);
        assert_err!(bus.start_supplier("dserver/test/1").await.map(|_| ()));

        bus.shutdown().await;
        assert!(bus.consumer().await.is_none());
        assert!(supplier.is_shutting_down());
    }
}
