//! Keep-alive task
//!
//! Scans every channel on a fixed interval. A channel whose heartbeat is
//! older than the staleness threshold goes SUSPECT and is reconnected under
//! its own lock; a failed attempt leaves it NOT_OK until the next scan.
//! Live channels get their subscriptions renewed in one batch call per
//! renewal interval, and pending stateless subscriptions are retried.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::consumer::EventConsumer;
use super::registry::{ChannelRecord, ChannelState, Subscriber};
use crate::admin::AdminProxy;
use crate::error::Result;
use crate::event::{EventData, EventPayload};
use crate::stats::ConsumerMetrics;
use crate::wire::value::{DevError, ErrSeverity};

/// Shortest sleep between two scans
const MIN_SLEEP: Duration = Duration::from_millis(10);

/// Reason code of the error event sent when a channel stops beating
pub const EVENT_TIMEOUT_REASON: &str = "API_EventTimeout";

/// Commands drained before each scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveCommand {
    /// Reconnect and re-subscribe the device's channel on the next scan
    AddDevice(String),
    /// Cancel the device's pending subscriptions
    RemoveDevice(String),
    Shutdown,
}

/// Command mailbox shared with the task
pub(crate) struct CommandQueue {
    queue: std::sync::Mutex<VecDeque<KeepAliveCommand>>,
    notify: Notify,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Queue a command and wake the task
    pub fn push(&self, command: KeepAliveCommand) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(command);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<KeepAliveCommand> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    async fn wait(&self, timeout: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Task body; exits on `Shutdown` or once the consumer is dropped
pub(crate) async fn run(consumer: Weak<EventConsumer>, commands: Arc<CommandQueue>, startup_delay: Duration) {
    commands.wait(startup_delay).await;
    loop {
        let Some(consumer) = consumer.upgrade() else {
            break;
        };
        if !consumer.apply_commands(commands.drain()).await {
            break;
        }
        let next = consumer.scan().await;
        drop(consumer);
        commands.wait(next).await;
    }
    tracing::debug!("Keep-alive task stopped");
}

impl EventConsumer {
    /// Returns false on shutdown
    async fn apply_commands(&self, commands: Vec<KeepAliveCommand>) -> bool {
        for command in commands {
            match command {
                KeepAliveCommand::Shutdown => return false,
                KeepAliveCommand::AddDevice(device) => {
                    let registry = self.registry.read().await;
                    let channel = registry
                        .devices
                        .get(&device)
                        .and_then(|name| registry.channels.get(name));
                    if let Some(channel) = channel {
                        channel.with_status(|s| s.state = ChannelState::Suspect);
                        tracing::debug!(device = %device, channel = %channel.name, "Channel reconnect forced");
                    }
                }
                KeepAliveCommand::RemoveDevice(device) => {
                    let mut registry = self.registry.write().await;
                    let before = registry.pending.len();
                    registry.pending.retain(|p| p.device != device);
                    let removed = before - registry.pending.len();
                    if removed > 0 {
                        tracing::debug!(device = %device, removed = removed, "Pending subscriptions cancelled");
                    }
                }
            }
        }
        true
    }

    /// One pass over channels and pending subscriptions; returns how long to
    /// sleep before the next one
    pub(super) async fn scan(&self) -> Duration {
        let channels: Vec<Arc<ChannelRecord>> =
            self.registry.read().await.channels.values().cloned().collect();
        let threshold = self.config.staleness_threshold();

        for channel in &channels {
            let now = Instant::now();
            let (stale, state, renew) = channel.with_status(|s| {
                let stale = now.saturating_duration_since(s.last_heartbeat) > threshold;
                let renew = now.saturating_duration_since(s.last_resubscribe)
                    >= self.config.resubscribe_interval();
                (stale, s.state, renew)
            });

            if stale || state != ChannelState::Ok {
                if state == ChannelState::Ok {
                    channel.with_status(|s| {
                        s.state = ChannelState::Suspect;
                        s.heartbeat_skipped = true;
                    });
                    tracing::warn!(channel = %channel.name, "Heartbeat missed, channel suspect");
                    self.notify_timeout(&channel.name).await;
                }
                self.reconnect(channel).await;
            } else if renew {
                self.renew(channel).await;
            }
        }

        self.retry_pending().await;
        self.next_sleep(&channels)
    }

    fn next_sleep(&self, channels: &[Arc<ChannelRecord>]) -> Duration {
        let threshold = self.config.staleness_threshold();
        let now = Instant::now();
        channels
            .iter()
            .filter_map(|c| {
                c.with_status(|s| {
                    (s.state == ChannelState::Ok)
                        .then(|| (s.last_heartbeat + threshold).saturating_duration_since(now))
                })
            })
            .fold(self.config.keep_alive_period, Duration::min)
            .max(MIN_SLEEP)
    }

    /// Send one timeout error event to every subscriber of `channel`
    async fn notify_timeout(&self, channel: &str) {
        let targets: Vec<(EventData, Vec<Subscriber>)> = {
            let registry = self.registry.read().await;
            registry
                .callbacks_of(channel)
                .map(|cb| {
                    let event = EventData::new(
                        cb.device.as_str(),
                        cb.attr.as_str(),
                        cb.event_name.as_str(),
                        cb.event_type,
                        EventPayload::Error(vec![DevError {
                            reason: EVENT_TIMEOUT_REASON.to_string(),
                            desc: format!(
                                "event channel {} not responding, server or event system may be down",
                                channel
                            ),
                            origin: "KeepAlive::scan".to_string(),
                            severity: ErrSeverity::Err,
                        }]),
                    );
                    (event, cb.subscribers.clone())
                })
                .collect()
        };
        for (event, subscribers) in targets {
            self.deliver(&subscribers, event).await;
        }
    }

    /// Reconnect a suspect channel under its lock
    async fn reconnect(&self, channel: &ChannelRecord) {
        let mut proxy = match channel.lock_proxy(self.config.channel_lock_timeout).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(channel = %channel.name, "Reconnection already in progress");
                return;
            }
        };

        match self.relink(channel).await {
            Ok(new_proxy) => {
                *proxy = new_proxy;
                let now = Instant::now();
                channel.with_status(|s| {
                    s.state = ChannelState::Ok;
                    s.last_heartbeat = now;
                    s.heartbeat_skipped = false;
                    s.last_resubscribe = now;
                });
                ConsumerMetrics::incr(&self.metrics.reconnections);
                tracing::info!(channel = %channel.name, "Channel reconnected");
            }
            Err(e) => {
                channel.with_status(|s| s.state = ChannelState::NotOk);
                ConsumerMetrics::incr(&self.metrics.reconnection_failures);
                tracing::warn!(channel = %channel.name, error = %e, "Channel reconnection failed");
            }
        }
    }

    /// Fetch a fresh proxy, re-register every subscription of the channel and
    /// reopen its links on the endpoints the publisher now advertises
    async fn relink(&self, channel: &ChannelRecord) -> Result<Arc<dyn AdminProxy>> {
        let proxy = self.resolver.connect_admin(&channel.admin_name).await?;
        let (requests, events): (Vec<_>, Vec<_>) = {
            let registry = self.registry.read().await;
            registry
                .callbacks_of(&channel.name)
                .map(|cb| (cb.request(), cb.event_name.clone()))
                .unzip()
        };
        let reply = proxy
            .subscription_change_batch(self.transport.kind().subscription_command(), &requests)
            .await?;

        let old = channel.status();
        self.transport
            .disconnect_channel(&channel.name, &old.heartbeat_endpoint)
            .await;
        for event in &events {
            self.transport
                .disconnect_event(event, &old.event_endpoint)
                .await;
        }

        self.transport
            .connect_channel(&channel.name, &reply.heartbeat_endpoint)
            .await?;
        for event in &events {
            self.transport
                .connect_event(event, &reply.event_endpoint)
                .await?;
        }
        channel.with_status(|s| {
            s.heartbeat_endpoint = reply.heartbeat_endpoint.clone();
            s.event_endpoint = reply.event_endpoint.clone();
        });
        Ok(proxy)
    }

    /// Renew the subscriptions of a live channel in one call
    async fn renew(&self, channel: &ChannelRecord) {
        let proxy = match channel.lock_proxy(self.config.channel_lock_timeout).await {
            Ok(guard) => Arc::clone(&*guard),
            Err(_) => return,
        };
        let requests: Vec<_> = {
            let registry = self.registry.read().await;
            registry.callbacks_of(&channel.name).map(|cb| cb.request()).collect()
        };
        match proxy
            .subscription_change_batch(self.transport.kind().subscription_command(), &requests)
            .await
        {
            Ok(_) => {
                channel.with_status(|s| s.last_resubscribe = Instant::now());
                tracing::debug!(channel = %channel.name, count = requests.len(), "Subscriptions renewed");
            }
            Err(e) => {
                tracing::warn!(channel = %channel.name, error = %e, "Subscription renewal failed");
            }
        }
    }

    /// Try every pending subscription once; promoted ones receive their
    /// initial event
    async fn retry_pending(&self) {
        let pending = self.registry.read().await.pending.clone();
        for p in pending {
            let conn = match self.connect(&p.device, &p.attr, p.event_type).await {
                Ok(conn) => conn,
                Err(e) => {
                    let mut registry = self.registry.write().await;
                    if let Some(entry) = registry.pending.iter_mut().find(|q| q.id == p.id) {
                        entry.last_attempt = Instant::now();
                    }
                    tracing::debug!(id = p.id, error = %e, "Pending subscription still failing");
                    continue;
                }
            };

            let subscriber = {
                let mut registry = self.registry.write().await;
                match registry.take_pending(p.id) {
                    Some(entry) => {
                        registry.insert(entry.id, &conn, entry.sink, entry.filter);
                        registry.end_connect(&conn.channel, &conn.event_name);
                        registry.subscriber(entry.id).cloned()
                    }
                    None => {
                        // cancelled while connecting
                        let teardown = registry.abandon(&conn);
                        drop(registry);
                        self.teardown(teardown).await;
                        continue;
                    }
                }
            };
            let Some(subscriber) = subscriber else {
                continue;
            };
            tracing::info!(id = p.id, event = %conn.event_name, "Pending subscription established");

            let payload = match conn.proxy.initial_event(&conn.device, &conn.attr, conn.event_type).await {
                Ok(payload) => payload,
                Err(e) => EventPayload::Error(e.to_dev_errors("KeepAlive::retry_pending")),
            };
            let event = EventData::new(
                conn.device.as_str(),
                conn.attr.as_str(),
                conn.event_name.as_str(),
                conn.event_type,
                payload,
            );
            self.deliver(&[subscriber], event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_wake_waiter() {
        let queue = Arc::new(CommandQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.wait(Duration::from_secs(60)).await;
                queue.drain()
            })
        };
        queue.push(KeepAliveCommand::AddDevice("sys/tg/1".into()));
        let drained = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drained, vec![KeepAliveCommand::AddDevice("sys/tg/1".into())]);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let queue = CommandQueue::new();
        let start = Instant::now();
        queue.wait(Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(queue.drain().is_empty());
    }
}
