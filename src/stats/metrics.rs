//! Statistics for event consumers and suppliers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live consumer counters, updated from the receive and keep-alive tasks
#[derive(Debug)]
pub struct ConsumerMetrics {
    started_at: Instant,
    pub(crate) events_received: AtomicU64,
    pub(crate) events_dispatched: AtomicU64,
    pub(crate) events_filtered: AtomicU64,
    pub(crate) events_unknown: AtomicU64,
    pub(crate) malformed_frames: AtomicU64,
    pub(crate) heartbeats: AtomicU64,
    pub(crate) reconnections: AtomicU64,
    pub(crate) reconnection_failures: AtomicU64,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events_received: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            events_filtered: AtomicU64::new(0),
            events_unknown: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            reconnection_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            uptime: self.started_at.elapsed(),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            events_unknown: self.events_unknown.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            reconnection_failures: self.reconnection_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time consumer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub uptime: Duration,
    /// Event messages taken off the transport
    pub events_received: u64,
    /// Deliveries to callbacks or queues (one event may fan out)
    pub events_dispatched: u64,
    /// Deliveries suppressed by a subscription filter
    pub events_filtered: u64,
    /// Events nobody is subscribed to
    pub events_unknown: u64,
    /// Frame sets dropped as undecodable
    pub malformed_frames: u64,
    pub heartbeats: u64,
    pub reconnections: u64,
    pub reconnection_failures: u64,
}

/// Live supplier counters
#[derive(Debug)]
pub struct SupplierMetrics {
    started_at: Instant,
    pub(crate) events_pushed: AtomicU64,
    pub(crate) push_failures: AtomicU64,
    pub(crate) heartbeats_sent: AtomicU64,
    pub(crate) subscriptions: AtomicU64,
}

impl SupplierMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events_pushed: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SupplierStats {
        SupplierStats {
            uptime: self.started_at.elapsed(),
            events_pushed: self.events_pushed.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
        }
    }
}

impl Default for SupplierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time supplier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupplierStats {
    pub uptime: Duration,
    pub events_pushed: u64,
    pub push_failures: u64,
    pub heartbeats_sent: u64,
    /// Subscription registrations accepted (renewals included)
    pub subscriptions: u64,
}

impl SupplierStats {
    /// Average events per second since start
    pub fn event_rate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.events_pushed as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_snapshot() {
        let metrics = ConsumerMetrics::new();
        ConsumerMetrics::incr(&metrics.events_received);
        ConsumerMetrics::incr(&metrics.events_received);
        ConsumerMetrics::incr(&metrics.malformed_frames);

        let stats = metrics.snapshot();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.events_dispatched, 0);
    }

    #[test]
    fn test_event_rate() {
        let stats = SupplierStats {
            uptime: Duration::from_secs(4),
            events_pushed: 10,
            ..Default::default()
        };
        assert_eq!(stats.event_rate(), 2.5);
        assert_eq!(SupplierStats::default().event_rate(), 0.0);
    }
}
