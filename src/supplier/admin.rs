//! Admin device of a server process

use std::sync::Arc;

use async_trait::async_trait;

use super::publisher::EventSupplier;
use crate::admin::{AdminProxy, SubscriptionReply, SubscriptionRequest};
use crate::error::{Error, Result};
use crate::event::{EventPayload, EventType};

/// Admin interface answering subscription registrations for one supplier
pub struct AdminDevice {
    supplier: Arc<EventSupplier>,
}

impl AdminDevice {
    pub fn new(supplier: Arc<EventSupplier>) -> Arc<Self> {
        Arc::new(Self { supplier })
    }

    pub fn supplier(&self) -> &Arc<EventSupplier> {
        &self.supplier
    }

    fn check_command(&self, command: &str) -> Result<()> {
        let expected = self.supplier.kind().subscription_command();
        if command.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(Error::precondition(
                "API_CommandNotFound",
                format!(
                    "{} does not support {} (expected {})",
                    self.supplier.admin_name(),
                    command,
                    expected
                ),
            ))
        }
    }
}

#[async_trait]
impl AdminProxy for AdminDevice {
    fn name(&self) -> &str {
        self.supplier.admin_name()
    }

    async fn subscription_change(
        &self,
        command: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionReply> {
        self.check_command(command)?;
        self.supplier.subscribe(request).await
    }

    async fn subscription_change_batch(
        &self,
        command: &str,
        requests: &[SubscriptionRequest],
    ) -> Result<SubscriptionReply> {
        self.check_command(command)?;
        if self.supplier.is_shutting_down() {
            return Err(Error::precondition(
                "API_ShutdownInProgress",
                format!("{} is shutting down", self.supplier.admin_name()),
            ));
        }
        for request in requests {
            if let Err(e) = self.supplier.subscribe(request).await {
                tracing::warn!(
                    device = %request.device,
                    attr = %request.attr,
                    event = %request.event_type,
                    error = %e,
                    "Subscription renewal refused"
                );
            }
        }
        Ok(self.supplier.endpoints())
    }

    async fn initial_event(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
    ) -> Result<EventPayload> {
        self.supplier.initial_event(device, attr, event_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventConfig;
    use crate::supplier::AttrProperties;
    use crate::transport::NotifHub;

    async fn admin() -> Arc<AdminDevice> {
        let supplier = EventSupplier::start(EventConfig::notif(NotifHub::new()), "dserver/test/1")
            .await
            .unwrap();
        supplier
            .register_attribute("sys/tg/1", "ampli", AttrProperties::pushed("ampli"))
            .await;
        AdminDevice::new(supplier)
    }

    #[tokio::test]
    async fn test_wrong_transport_command() {
        let admin = admin().await;
        let req = SubscriptionRequest::subscribe("sys/tg/1", "ampli", EventType::User);

        let err = admin
            .subscription_change("SocketEventSubscriptionChange", &req)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "API_CommandNotFound");
        assert!(admin
            .subscription_change("EventSubscriptionChange", &req)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_batch_skips_refused_requests() {
        let admin = admin().await;
        let requests = vec![
            SubscriptionRequest::subscribe("sys/tg/1", "ampli", EventType::User),
            SubscriptionRequest::subscribe("sys/tg/1", "missing", EventType::User),
        ];
        let reply = admin
            .subscription_change_batch("EventSubscriptionChange", &requests)
            .await
            .unwrap();
        assert_eq!(reply.event_endpoint, "inproc://dserver/test/1/event");
        assert_eq!(admin.supplier().stats().subscriptions, 1);
    }
}
