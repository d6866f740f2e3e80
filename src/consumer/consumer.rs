//! Event consumer
//!
//! Client-side façade: subscribe and unsubscribe, the receive task that
//! decodes inbound frame sets and dispatches them, and the queue queries of
//! queue-mode subscriptions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;

use super::deferred::{run_teardown, DeferredUnsubscriber};
use super::keepalive::{self, CommandQueue, KeepAliveCommand};
use super::registry::{
    ChannelRecord, ChannelState, Connection, PendingSubscription, Registry, Subscriber, Teardown,
};
use crate::admin::{AdminResolver, SubscriptionRequest};
use crate::config::EventConfig;
use crate::error::{Error, Result};
use crate::event::callback::SinkHandle;
use crate::event::types::{channel_name, channel_of_heartbeat, event_name};
use crate::event::{EventData, EventFilter, EventSink, EventType};
use crate::stats::{ConsumerMetrics, ConsumerStats};
use crate::transport::{self, ConsumerTransport};
use crate::wire::message::WireMessage;

tokio::task_local! {
    /// Set while events are handed to sinks
    static DISPATCHING: bool;
}

fn in_dispatch() -> bool {
    DISPATCHING.try_with(|d| *d).unwrap_or(false)
}

/// Receiving side of the bus for one process
pub struct EventConsumer {
    pub(super) config: EventConfig,
    pub(super) resolver: Arc<dyn AdminResolver>,
    pub(super) transport: Arc<dyn ConsumerTransport>,
    pub(super) registry: RwLock<Registry>,
    pub(super) metrics: ConsumerMetrics,
    pub(super) commands: Arc<CommandQueue>,
    next_id: AtomicU64,
    deferred: DeferredUnsubscriber,
    tasks: std::sync::Mutex<Vec<AbortHandle>>,
    shutting_down: AtomicBool,
}

impl EventConsumer {
    /// Create the consumer and spawn its receive, keep-alive and cleanup tasks
    pub fn start(config: EventConfig, resolver: Arc<dyn AdminResolver>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.inbound_capacity);
        let transport = transport::consumer_transport(&config.transport, tx);
        let (deferred, deferred_task) = DeferredUnsubscriber::spawn(Arc::clone(&transport));
        let commands = Arc::new(CommandQueue::new());

        let consumer = Arc::new(Self {
            config,
            resolver,
            transport,
            registry: RwLock::new(Registry::default()),
            metrics: ConsumerMetrics::new(),
            commands: Arc::clone(&commands),
            next_id: AtomicU64::new(1),
            deferred,
            tasks: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        let receive = tokio::spawn(receive_loop(Arc::downgrade(&consumer), rx));
        let keep_alive = tokio::spawn(keepalive::run(
            Arc::downgrade(&consumer),
            commands,
            consumer.config.keep_alive_startup_delay,
        ));
        consumer.lock_tasks().extend([
            receive.abort_handle(),
            keep_alive.abort_handle(),
            deferred_task.abort_handle(),
        ]);

        tracing::info!(transport = ?consumer.transport.kind(), "Event consumer started");
        consumer
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Subscribe to `event_type` events of `device/attr`
    ///
    /// Returns the subscription id. With `stateless` set, a subscription that
    /// cannot be set up now is kept pending and retried by the keep-alive
    /// task; the id is valid either way.
    pub async fn subscribe_event(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
        sink: EventSink,
        filters: &[String],
        stateless: bool,
    ) -> Result<u64> {
        if self.is_shutting_down() {
            return Err(Error::EventSystemFailed("consumer is shut down".into()));
        }
        let filter = EventFilter::parse(filters)?.map(Arc::new);
        let device = device.to_lowercase();
        let attr = attr.to_lowercase();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sink = SinkHandle::from_sink(sink);

        match self.connect(&device, &attr, event_type).await {
            Ok(conn) => {
                let mut registry = self.registry.write().await;
                registry.insert(id, &conn, sink, filter);
                registry.end_connect(&conn.channel, &conn.event_name);
                drop(registry);
                tracing::debug!(id = id, event = %conn.event_name, "Subscribed");
                Ok(id)
            }
            Err(e) if stateless => {
                tracing::warn!(
                    id = id,
                    device = %device,
                    attr = %attr,
                    event = %event_type,
                    error = %e,
                    "Subscription failed, kept pending"
                );
                self.registry.write().await.pending.push(PendingSubscription {
                    id,
                    device,
                    attr,
                    event_type,
                    sink,
                    filter,
                    last_attempt: Instant::now(),
                });
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Register with the publisher and open the transport links
    ///
    /// On success the connect stays marked in flight, so a concurrent
    /// release keeps its links; the caller inserts the connection and ends
    /// the mark under one write lock, or abandons it.
    pub(super) async fn connect(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
    ) -> Result<Connection> {
        let admin_name = self.resolver.admin_name(device).await?;
        let channel = channel_name(&self.config.fqdn_prefix, &admin_name);
        let event_name = event_name(&self.config.fqdn_prefix, device, attr, event_type);
        let existing = {
            let mut registry = self.registry.write().await;
            registry.begin_connect(&channel, &event_name);
            registry.channels.get(&channel).cloned()
        };

        let result = self
            .open_links(
                device,
                attr,
                event_type,
                admin_name,
                channel.clone(),
                event_name.clone(),
                existing,
            )
            .await;
        if result.is_err() {
            let teardown = {
                let mut registry = self.registry.write().await;
                registry.end_connect(&channel, &event_name);
                registry.release(&channel, Vec::new())
            };
            self.teardown(teardown).await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_links(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
        admin_name: String,
        channel: String,
        event_name: String,
        existing: Option<Arc<ChannelRecord>>,
    ) -> Result<Connection> {
        let proxy = match &existing {
            Some(record) => Arc::clone(&*record.lock_proxy(self.config.channel_lock_timeout).await?),
            None => self.resolver.connect_admin(&admin_name).await?,
        };
        let request = SubscriptionRequest::subscribe(device, attr, event_type);
        let reply = proxy
            .subscription_change(self.transport.kind().subscription_command(), &request)
            .await?;

        if let Some(record) = &existing {
            record.with_status(|s| {
                if s.event_endpoint != reply.event_endpoint
                    || s.heartbeat_endpoint != reply.heartbeat_endpoint
                {
                    tracing::info!(channel = %channel, "Publisher endpoints moved");
                    s.state = ChannelState::Suspect;
                }
            });
        }

        self.transport
            .connect_channel(&channel, &reply.heartbeat_endpoint)
            .await?;
        self.transport
            .connect_event(&event_name, &reply.event_endpoint)
            .await?;

        Ok(Connection {
            channel,
            admin_name,
            proxy,
            heartbeat_endpoint: reply.heartbeat_endpoint,
            event_endpoint: reply.event_endpoint,
            device: device.to_string(),
            attr: attr.to_string(),
            event_type,
            event_name,
        })
    }

    /// Remove a subscription
    ///
    /// Unknown or already removed ids are a no-op. Called from inside a
    /// dispatch, link teardown is handed to the cleanup task.
    pub async fn unsubscribe_event(&self, id: u64) -> Result<()> {
        let teardown = {
            let mut registry = self.registry.write().await;
            if registry.take_pending(id).is_some() {
                tracing::debug!(id = id, "Pending subscription cancelled");
                return Ok(());
            }
            registry.remove(id)
        };
        let Some(teardown) = teardown else {
            return Ok(());
        };
        tracing::debug!(id = id, "Unsubscribed");
        self.teardown(teardown).await;
        Ok(())
    }

    /// Drop links, deferred to the cleanup task inside a dispatch
    pub(super) async fn teardown(&self, teardown: Teardown) {
        if teardown.is_empty() {
            return;
        }
        if in_dispatch() {
            self.deferred.schedule(teardown);
        } else {
            run_teardown(self.transport.as_ref(), teardown).await;
        }
    }

    /// Handle one inbound frame set
    pub(super) async fn dispatch(&self, frames: Vec<Bytes>) {
        let msg = match WireMessage::from_frames(frames) {
            Ok(msg) => msg,
            Err(e) => {
                ConsumerMetrics::incr(&self.metrics.malformed_frames);
                tracing::warn!(error = %e, "Malformed frame set dropped");
                return;
            }
        };
        if msg.is_heartbeat() {
            self.on_heartbeat(&msg.name).await;
            return;
        }

        ConsumerMetrics::incr(&self.metrics.events_received);
        let target = {
            let registry = self.registry.read().await;
            registry.callbacks.get(&msg.name).map(|cb| {
                (
                    cb.device.clone(),
                    cb.attr.clone(),
                    cb.event_type,
                    cb.subscribers.clone(),
                )
            })
        };
        let Some((device, attr, event_type, subscribers)) = target else {
            ConsumerMetrics::incr(&self.metrics.events_unknown);
            tracing::debug!(event = %msg.name, "Event without subscriber");
            return;
        };

        match EventData::from_message(msg, &device, &attr, event_type) {
            Ok(event) => self.deliver(&subscribers, event).await,
            Err(e) => {
                ConsumerMetrics::incr(&self.metrics.malformed_frames);
                tracing::warn!(device = %device, attr = %attr, error = %e, "Undecodable event dropped");
            }
        }
    }

    async fn on_heartbeat(&self, name: &str) {
        let Some(channel) = channel_of_heartbeat(name) else {
            return;
        };
        let record = self.registry.read().await.channels.get(channel).cloned();
        if let Some(record) = record {
            record.touch_heartbeat();
            ConsumerMetrics::incr(&self.metrics.heartbeats);
            tracing::trace!(channel = %channel, "Heartbeat");
        }
    }

    /// Hand `event` to every active subscriber whose filter accepts it
    pub(super) async fn deliver(&self, subscribers: &[Subscriber], event: EventData) {
        DISPATCHING
            .scope(true, async {
                for sub in subscribers {
                    if !sub.is_active() {
                        continue;
                    }
                    if let Some(filter) = &sub.filter {
                        if !filter.matches(&event) {
                            ConsumerMetrics::incr(&self.metrics.events_filtered);
                            continue;
                        }
                    }
                    sub.sink.deliver(event.clone()).await;
                    ConsumerMetrics::incr(&self.metrics.events_dispatched);
                }
            })
            .await
    }

    async fn with_queue<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut crate::event::EventQueue) -> R,
    ) -> Result<R> {
        let queue = {
            let registry = self.registry.read().await;
            let sink = registry.sink(id).ok_or(Error::UnknownSubscription(id))?;
            Arc::clone(sink.queue().ok_or(Error::NotQueueSink(id))?)
        };
        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        Ok(f(&mut *queue))
    }

    /// Drain the queued events of a queue-mode subscription
    pub async fn get_events(&self, id: u64) -> Result<Vec<EventData>> {
        self.with_queue(id, |q| q.get_events()).await
    }

    pub async fn event_queue_size(&self, id: u64) -> Result<usize> {
        self.with_queue(id, |q| q.size()).await
    }

    pub async fn is_event_queue_empty(&self, id: u64) -> Result<bool> {
        self.with_queue(id, |q| q.is_empty()).await
    }

    /// Reception date of the newest event ever queued
    pub async fn get_last_event_date(&self, id: u64) -> Result<Option<SystemTime>> {
        self.with_queue(id, |q| q.get_last_event_date()).await
    }

    pub async fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.registry
            .read()
            .await
            .channels
            .get(channel)
            .map(|c| c.state())
    }

    /// Channel a device's events arrive on
    pub async fn channel_of(&self, device: &str) -> Option<String> {
        self.registry
            .read()
            .await
            .devices
            .get(&device.to_lowercase())
            .cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.registry.read().await.channels.len()
    }

    pub async fn callback_count(&self) -> usize {
        self.registry.read().await.callbacks.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.registry.read().await.pending.len()
    }

    /// Whether `id` is waiting for its first successful connect
    pub async fn is_pending(&self, id: u64) -> bool {
        self.registry
            .read()
            .await
            .pending
            .iter()
            .any(|p| p.id == id)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.metrics.snapshot()
    }

    /// Force the device's channel to reconnect on the next scan
    pub fn add_device(&self, device: &str) {
        self.commands
            .push(KeepAliveCommand::AddDevice(device.to_lowercase()));
    }

    /// Cancel every pending subscription of the device
    pub fn remove_device(&self, device: &str) {
        self.commands
            .push(KeepAliveCommand::RemoveDevice(device.to_lowercase()));
    }

    /// Stop every task and drop every link
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.commands.push(KeepAliveCommand::Shutdown);
        let tasks: Vec<AbortHandle> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        {
            let mut registry = self.registry.write().await;
            for record in registry.callbacks.values() {
                for sub in &record.subscribers {
                    sub.deactivate();
                }
            }
            *registry = Registry::default();
        }
        self.transport.close().await;
        tracing::info!("Event consumer stopped");
    }
}

async fn receive_loop(consumer: Weak<EventConsumer>, mut rx: mpsc::Receiver<Vec<Bytes>>) {
    while let Some(frames) = rx.recv().await {
        let Some(consumer) = consumer.upgrade() else {
            break;
        };
        consumer.dispatch(frames).await;
    }
    tracing::debug!("Receive task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::Directory;
    use crate::event::ChannelCallback;
    use crate::supplier::{AdminDevice, AttrProperties, EventSupplier};
    use crate::transport::NotifHub;
    use crate::wire::value::{AttributeValue, Quality};
    use std::time::Duration;

    const DEVICE: &str = "sys/tg/1";

    struct Fixture {
        consumer: Arc<EventConsumer>,
        supplier: Arc<EventSupplier>,
    }

    async fn fixture() -> Fixture {
        let hub = NotifHub::new();
        let config = EventConfig::notif(hub).keep_alive_startup_delay(Duration::from_secs(60));
        let supplier = EventSupplier::start(config.clone(), "dserver/test/1")
            .await
            .unwrap();
        supplier
            .register_attribute(DEVICE, "ampli", AttrProperties::pushed("ampli"))
            .await;
        supplier
            .register_attribute(DEVICE, "double", AttrProperties::pushed("double"))
            .await;
        let directory = Directory::new();
        directory
            .register_server(AdminDevice::new(Arc::clone(&supplier)), &[DEVICE])
            .await;
        let consumer = EventConsumer::start(config, directory);
        Fixture { consumer, supplier }
    }

    fn value(v: f64) -> crate::supplier::Sample {
        Ok(AttributeValue::double("ampli", v, Quality::Valid))
    }

    async fn wait_for_queue(consumer: &EventConsumer, id: u64, n: usize) {
        for _ in 0..200 {
            if consumer.event_queue_size(id).await.unwrap() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue {} never reached {} events", id, n);
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let f = fixture().await;
        let id = f
            .consumer
            .subscribe_event(DEVICE, "Ampli", EventType::Change, EventSink::Queue(10), &[], false)
            .await
            .unwrap();
        assert_eq!(f.consumer.channel_count().await, 1);
        assert_eq!(f.consumer.callback_count().await, 1);

        assert!(f.supplier.push_change_event(DEVICE, "ampli", value(3.5)).await.unwrap());
        wait_for_queue(&f.consumer, id, 1).await;

        let events = f.consumer.get_events(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value().unwrap().data.first_f64(), Some(3.5));
        assert!(f.consumer.is_event_queue_empty(id).await.unwrap());
        assert!(f.consumer.get_last_event_date(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_subscribe_refused() {
        let f = fixture().await;
        let err = f
            .consumer
            .subscribe_event(DEVICE, "missing", EventType::Change, EventSink::Queue(1), &[], false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "API_AttrNotFound");
        assert_eq!(f.consumer.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected() {
        let f = fixture().await;
        let err = f
            .consumer
            .subscribe_event(
                DEVICE,
                "ampli",
                EventType::Change,
                EventSink::Queue(1),
                &["$current >".to_string()],
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "API_InvalidFilter");
        assert_eq!(f.consumer.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_queue_queries_on_callback_subscription() {
        let f = fixture().await;
        let (cb, _rx) = ChannelCallback::new();
        let id = f
            .consumer
            .subscribe_event(DEVICE, "ampli", EventType::Change, EventSink::callback(cb), &[], false)
            .await
            .unwrap();
        assert!(matches!(
            f.consumer.get_events(id).await,
            Err(Error::NotQueueSink(_))
        ));
        assert!(matches!(
            f.consumer.event_queue_size(999).await,
            Err(Error::UnknownSubscription(999))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_tears_down_channel() {
        let f = fixture().await;
        let a = f
            .consumer
            .subscribe_event(DEVICE, "ampli", EventType::Change, EventSink::Queue(4), &[], false)
            .await
            .unwrap();
        let b = f
            .consumer
            .subscribe_event(DEVICE, "double", EventType::Change, EventSink::Queue(4), &[], false)
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(f.consumer.callback_count().await, 2);

        f.consumer.unsubscribe_event(a).await.unwrap();
        assert_eq!(f.consumer.channel_count().await, 1);
        f.consumer.unsubscribe_event(b).await.unwrap();
        f.consumer.unsubscribe_event(b).await.unwrap();
        assert_eq!(f.consumer.channel_count().await, 0);
        assert_eq!(f.consumer.callback_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_during_connect_keeps_links() {
        let f = fixture().await;
        let first = f
            .consumer
            .subscribe_event(DEVICE, "ampli", EventType::Change, EventSink::Queue(4), &[], false)
            .await
            .unwrap();

        // a second subscribe has opened its links but not inserted yet
        let conn = f.consumer.connect(DEVICE, "ampli", EventType::Change).await.unwrap();
        f.consumer.unsubscribe_event(first).await.unwrap();
        assert_eq!(f.consumer.channel_count().await, 1);

        let second = 1000;
        {
            let mut registry = f.consumer.registry.write().await;
            registry.insert(second, &conn, SinkHandle::from_sink(EventSink::Queue(4)), None);
            registry.end_connect(&conn.channel, &conn.event_name);
        }
        assert!(f.supplier.push_change_event(DEVICE, "ampli", value(1.0)).await.unwrap());
        wait_for_queue(&f.consumer, second, 1).await;
    }

    #[tokio::test]
    async fn test_malformed_frames_counted() {
        let f = fixture().await;
        f.consumer
            .dispatch(vec![Bytes::from_static(b"garbage")])
            .await;
        assert_eq!(f.consumer.stats().malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_stateless_subscription_pending() {
        let f = fixture().await;
        let id = f
            .consumer
            .subscribe_event("sys/unknown/1", "x", EventType::Change, EventSink::Queue(4), &[], true)
            .await
            .unwrap();
        assert!(f.consumer.is_pending(id).await);
        assert!(f.consumer.is_event_queue_empty(id).await.unwrap());

        f.consumer.unsubscribe_event(id).await.unwrap();
        assert_eq!(f.consumer.pending_count().await, 0);
    }
}
