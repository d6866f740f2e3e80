//! Event system configuration

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{NotifHub, TransportKind};

/// Wire protocol version carried in every call header
pub const PROTOCOL_VERSION: i32 = 1;

/// Library version advertised in subscription replies
pub const LIB_VERSION: i32 = 100;

/// Default fully-qualified name prefix
pub const DEFAULT_FQDN_PREFIX: &str = "evbus://localhost:10000/";

/// Pub/sub socket transport options
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Host to bind the publisher sockets on
    pub bind_host: String,

    /// Ports to try, in order (None = any free port)
    pub port_range: Option<RangeInclusive<u16>>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port_range: None,
        }
    }
}

/// Transport used by both sides of one bus
#[derive(Clone)]
pub enum TransportConfig {
    /// Broker-style notification service shared by all buses in the process
    Notif(Arc<NotifHub>),
    /// Pub/sub sockets
    Tcp(TcpConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Notif(_) => TransportKind::Notif,
            TransportConfig::Tcp(_) => TransportKind::Tcp,
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportConfig::Notif(_) => f.write_str("Notif"),
            TransportConfig::Tcp(tcp) => f.debug_tuple("Tcp").field(tcp).finish(),
        }
    }
}

/// Event system configuration options
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Transport selection
    pub transport: TransportConfig,

    /// Prefix of every fully-qualified event and channel name
    pub fqdn_prefix: String,

    /// Heartbeat period of a supplier
    pub heartbeat_period: Duration,

    /// How early a heartbeat may fire (scheduler tolerance)
    pub heartbeat_jitter: Duration,

    /// Channel is stale after `heartbeat_period * staleness_factor` without heartbeat
    pub staleness_factor: u32,

    /// Keep-alive scan interval
    pub keep_alive_period: Duration,

    /// Delay before the first keep-alive scan
    pub keep_alive_startup_delay: Duration,

    /// Subscriptions lapse on the supplier after this long without renewal
    pub resubscribe_period: Duration,

    /// Bounded wait on a channel's reconnection mutex
    pub channel_lock_timeout: Duration,

    /// Capacity of the inbound frame channel feeding the receive task
    pub inbound_capacity: usize,

    /// Capacity of each publisher broadcast channel
    pub publish_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::Tcp(TcpConfig::default()),
            fqdn_prefix: DEFAULT_FQDN_PREFIX.to_string(),
            heartbeat_period: Duration::from_secs(10),
            heartbeat_jitter: Duration::from_secs(1),
            staleness_factor: 3,
            keep_alive_period: Duration::from_secs(10),
            keep_alive_startup_delay: Duration::from_secs(2),
            resubscribe_period: Duration::from_secs(600),
            channel_lock_timeout: Duration::from_millis(500),
            inbound_capacity: 4096,
            publish_capacity: 1024,
        }
    }
}

impl EventConfig {
    /// Config using the in-process notification hub
    pub fn notif(hub: Arc<NotifHub>) -> Self {
        Self {
            transport: TransportConfig::Notif(hub),
            ..Default::default()
        }
    }

    /// Config using pub/sub sockets
    pub fn tcp(tcp: TcpConfig) -> Self {
        Self {
            transport: TransportConfig::Tcp(tcp),
            ..Default::default()
        }
    }

    /// Set the name prefix
    pub fn fqdn_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into().to_lowercase();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.fqdn_prefix = prefix;
        self
    }

    /// Set heartbeat period; jitter is kept at a tenth of it
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self.heartbeat_jitter = period / 10;
        self
    }

    /// Set staleness factor (minimum 1)
    pub fn staleness_factor(mut self, factor: u32) -> Self {
        self.staleness_factor = factor.max(1);
        self
    }

    /// Set keep-alive scan interval
    pub fn keep_alive_period(mut self, period: Duration) -> Self {
        self.keep_alive_period = period;
        self
    }

    /// Set delay before the first keep-alive scan
    pub fn keep_alive_startup_delay(mut self, delay: Duration) -> Self {
        self.keep_alive_startup_delay = delay;
        self
    }

    /// Set subscription lapse period
    pub fn resubscribe_period(mut self, period: Duration) -> Self {
        self.resubscribe_period = period;
        self
    }

    /// Set channel lock timeout
    pub fn channel_lock_timeout(mut self, timeout: Duration) -> Self {
        self.channel_lock_timeout = timeout;
        self
    }

    /// Set inbound channel capacity (minimum 1)
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    /// Time without heartbeat after which a channel is considered dead
    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_period * self.staleness_factor
    }

    /// Minimum spacing between two heartbeats of one supplier
    pub fn heartbeat_min_interval(&self) -> Duration {
        self.heartbeat_period.saturating_sub(self.heartbeat_jitter)
    }

    /// How often live subscriptions are renewed on the supplier
    pub fn resubscribe_interval(&self) -> Duration {
        self.resubscribe_period / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EventConfig::default();

        assert_eq!(config.transport.kind(), TransportKind::Tcp);
        assert_eq!(config.fqdn_prefix, DEFAULT_FQDN_PREFIX);
        assert_eq!(config.heartbeat_period, Duration::from_secs(10));
        assert_eq!(config.staleness_factor, 3);
        assert_eq!(config.keep_alive_period, Duration::from_secs(10));
        assert_eq!(config.channel_lock_timeout, Duration::from_millis(500));
        assert_eq!(config.inbound_capacity, 4096);
    }

    #[test]
    fn test_derived_intervals() {
        let config = EventConfig::default();

        assert_eq!(config.staleness_threshold(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_min_interval(), Duration::from_secs(9));
        assert_eq!(config.resubscribe_interval(), Duration::from_secs(200));
    }

    #[test]
    fn test_builder_pattern() {
        let config = EventConfig::notif(NotifHub::new())
            .fqdn_prefix("EVBUS://Host:1")
            .heartbeat_period(Duration::from_millis(200))
            .staleness_factor(0)
            .inbound_capacity(0);

        assert_eq!(config.transport.kind(), TransportKind::Notif);
        assert_eq!(config.fqdn_prefix, "evbus://host:1/");
        assert_eq!(config.heartbeat_jitter, Duration::from_millis(20));
        assert_eq!(config.staleness_factor, 1);
        assert_eq!(config.inbound_capacity, 1);
    }

    #[test]
    fn test_tcp_defaults() {
        let tcp = TcpConfig::default();
        assert_eq!(tcp.bind_host, "127.0.0.1");
        assert!(tcp.port_range.is_none());
    }
}
