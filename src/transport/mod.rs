//! Event transports
//!
//! Two interchangeable transports carry the multi-frame messages: an
//! in-process notification hub and pub/sub TCP sockets. One is chosen per bus
//! at configuration time; suppliers and consumers only see the capability
//! traits below.
//!
//! ```text
//!   EventSupplier                                   EventConsumer
//!        │ publish(stream, frames)                        ▲
//!        ▼                                                │ mpsc (one receive task)
//!  PublisherTransport ──► heartbeat endpoint ──► link ────┤
//!                     ──► event endpoint ─────► link ─────┘
//!                                              (filters by subscribed names)
//! ```

pub mod link;
pub mod notif;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::error::Result;

pub use notif::NotifHub;

/// Sender side of a consumer's inbound frame channel
pub type Inbound = mpsc::Sender<Vec<Bytes>>;

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Notif,
    Tcp,
}

impl TransportKind {
    /// Admin command a consumer of this transport sends to register a subscription
    pub fn subscription_command(self) -> &'static str {
        match self {
            TransportKind::Notif => "EventSubscriptionChange",
            TransportKind::Tcp => "SocketEventSubscriptionChange",
        }
    }

    pub fn from_command(command: &str) -> Option<Self> {
        [TransportKind::Notif, TransportKind::Tcp]
            .into_iter()
            .find(|k| k.subscription_command().eq_ignore_ascii_case(command))
    }
}

/// Publisher stream a message goes out on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Heartbeat,
    Event,
}

/// Publishing side of a transport
#[async_trait]
pub trait PublisherTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Endpoint advertised for heartbeats
    fn heartbeat_endpoint(&self) -> &str;

    /// Endpoint advertised for events
    fn event_endpoint(&self) -> &str;

    /// Send one message to every connected subscriber
    ///
    /// Having no subscriber is not an error.
    async fn publish(&self, stream: Stream, frames: Vec<Bytes>) -> Result<()>;

    /// Release the endpoints; later publishes fail
    async fn close(&self);
}

/// Receiving side of a transport
///
/// Every received message whose name was connected is forwarded to the
/// inbound channel given at construction.
#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start receiving heartbeats of `channel`
    async fn connect_channel(&self, channel: &str, heartbeat_endpoint: &str) -> Result<()>;

    async fn disconnect_channel(&self, channel: &str, heartbeat_endpoint: &str);

    /// Start receiving events named `event_name`
    async fn connect_event(&self, event_name: &str, endpoint: &str) -> Result<()>;

    async fn disconnect_event(&self, event_name: &str, endpoint: &str);

    /// Drop every link
    async fn close(&self);
}

/// Bind the publisher endpoints of one supplier
pub(crate) async fn bind_publisher(
    config: &TransportConfig,
    admin_name: &str,
    capacity: usize,
) -> Result<Arc<dyn PublisherTransport>> {
    match config {
        TransportConfig::Notif(hub) => Ok(Arc::new(
            notif::NotifPublisher::bind(Arc::clone(hub), admin_name).await?,
        )),
        TransportConfig::Tcp(tcp) => Ok(Arc::new(tcp::TcpPublisher::bind(tcp, capacity).await?)),
    }
}

/// Consumer side of the configured transport
pub(crate) fn consumer_transport(
    config: &TransportConfig,
    inbound: Inbound,
) -> Arc<dyn ConsumerTransport> {
    match config {
        TransportConfig::Notif(hub) => Arc::new(notif::NotifConsumer::new(Arc::clone(hub), inbound)),
        TransportConfig::Tcp(_) => Arc::new(tcp::TcpConsumer::new(inbound)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_commands() {
        assert_eq!(
            TransportKind::Notif.subscription_command(),
            "EventSubscriptionChange"
        );
        assert_eq!(
            TransportKind::Tcp.subscription_command(),
            "SocketEventSubscriptionChange"
        );
        assert_eq!(
            TransportKind::from_command("socketeventsubscriptionchange"),
            Some(TransportKind::Tcp)
        );
        assert_eq!(TransportKind::from_command("Init"), None);
    }
}
