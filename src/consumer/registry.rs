//! Subscription registry
//!
//! Channel table, callback table, device to channel table and pending
//! subscriptions. The whole registry sits behind one `RwLock` owned by the
//! consumer; each channel carries its own reconnection mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::admin::{AdminProxy, SubscriptionRequest};
use crate::error::{Error, Result};
use crate::event::callback::SinkHandle;
use crate::event::{EventFilter, EventType};

/// Liveness of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Heartbeats arrive on time
    Ok,
    /// Heartbeats missed; reconnection pending
    Suspect,
    /// Last reconnection attempt failed
    NotOk,
}

/// Endpoints and heartbeat bookkeeping of a channel
#[derive(Debug, Clone)]
pub(crate) struct ChannelStatus {
    pub heartbeat_endpoint: String,
    pub event_endpoint: String,
    pub last_heartbeat: Instant,
    pub heartbeat_skipped: bool,
    pub state: ChannelState,
    pub last_resubscribe: Instant,
}

/// One publisher process seen by this consumer
pub(crate) struct ChannelRecord {
    pub name: String,
    pub admin_name: String,

    /// Admin proxy; the lock serializes reconnection of this channel
    proxy: Mutex<Arc<dyn AdminProxy>>,

    status: std::sync::Mutex<ChannelStatus>,
}

impl ChannelRecord {
    pub fn new(
        name: &str,
        admin_name: &str,
        proxy: Arc<dyn AdminProxy>,
        heartbeat_endpoint: &str,
        event_endpoint: &str,
    ) -> Self {
        let now = Instant::now();
        Self {
            name: name.to_string(),
            admin_name: admin_name.to_string(),
            proxy: Mutex::new(proxy),
            status: std::sync::Mutex::new(ChannelStatus {
                heartbeat_endpoint: heartbeat_endpoint.to_string(),
                event_endpoint: event_endpoint.to_string(),
                last_heartbeat: now,
                heartbeat_skipped: false,
                state: ChannelState::Ok,
                last_resubscribe: now,
            }),
        }
    }

    /// Run `f` on the channel status
    pub fn with_status<R>(&self, f: impl FnOnce(&mut ChannelStatus) -> R) -> R {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status)
    }

    pub fn status(&self) -> ChannelStatus {
        self.with_status(|s| s.clone())
    }

    pub fn state(&self) -> ChannelState {
        self.with_status(|s| s.state)
    }

    pub fn touch_heartbeat(&self) {
        self.with_status(|s| {
            s.last_heartbeat = Instant::now();
            s.heartbeat_skipped = false;
        });
    }

    /// Acquire the reconnection lock within `wait`
    pub async fn lock_proxy(
        &self,
        wait: Duration,
    ) -> Result<tokio::sync::MutexGuard<'_, Arc<dyn AdminProxy>>> {
        tokio::time::timeout(wait, self.proxy.lock())
            .await
            .map_err(|_| {
                Error::CommunicationFailed(format!("channel {} is busy reconnecting", self.name))
            })
    }
}

/// One delivery target inside a callback record
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub id: u64,
    pub sink: SinkHandle,
    pub filter: Option<Arc<EventFilter>>,
    /// Cleared on unsubscribe; dispatch skips inactive subscribers it copied
    pub active: Arc<AtomicBool>,
}

impl Subscriber {
    pub fn new(id: u64, sink: SinkHandle, filter: Option<Arc<EventFilter>>) -> Self {
        Self {
            id,
            sink,
            filter,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Every subscriber of one fully-qualified event name
pub(crate) struct CallbackRecord {
    pub device: String,
    pub attr: String,
    pub event_type: EventType,
    pub channel: String,
    pub event_name: String,
    pub last_subscribed: Instant,
    pub subscribers: Vec<Subscriber>,
}

impl CallbackRecord {
    pub fn request(&self) -> SubscriptionRequest {
        SubscriptionRequest::subscribe(&self.device, &self.attr, self.event_type)
    }
}

/// Stateless subscription waiting for its first successful connect
#[derive(Clone)]
pub(crate) struct PendingSubscription {
    pub id: u64,
    pub device: String,
    pub attr: String,
    pub event_type: EventType,
    pub sink: SinkHandle,
    pub filter: Option<Arc<EventFilter>>,
    pub last_attempt: Instant,
}

/// Transport links to drop after a subscription went away
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Teardown {
    /// (event name, event endpoint)
    pub events: Vec<(String, String)>,
    /// (channel name, heartbeat endpoint)
    pub channel: Option<(String, String)>,
}

impl Teardown {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.channel.is_none()
    }
}

/// Result of a successful connect, ready to be inserted
pub(crate) struct Connection {
    pub channel: String,
    pub admin_name: String,
    pub proxy: Arc<dyn AdminProxy>,
    pub heartbeat_endpoint: String,
    pub event_endpoint: String,
    pub device: String,
    pub attr: String,
    pub event_type: EventType,
    pub event_name: String,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub channels: HashMap<String, Arc<ChannelRecord>>,
    /// Keyed by fully-qualified event name
    pub callbacks: HashMap<String, CallbackRecord>,
    /// Device name to channel name
    pub devices: HashMap<String, String>,
    pub pending: Vec<PendingSubscription>,
    /// Subscription id to event name
    pub ids: HashMap<u64, String>,
    /// Connects in flight per channel name; their links must survive release
    connecting_channels: HashMap<String, usize>,
    /// Connects in flight per event name
    connecting_events: HashMap<String, usize>,
}

impl Registry {
    /// Insert a connected subscriber, creating channel and callback records
    /// as needed
    pub fn insert(&mut self, id: u64, conn: &Connection, sink: SinkHandle, filter: Option<Arc<EventFilter>>) {
        self.channels.entry(conn.channel.clone()).or_insert_with(|| {
            tracing::info!(
                channel = %conn.channel,
                heartbeat = %conn.heartbeat_endpoint,
                event = %conn.event_endpoint,
                "Channel connected"
            );
            Arc::new(ChannelRecord::new(
                &conn.channel,
                &conn.admin_name,
                Arc::clone(&conn.proxy),
                &conn.heartbeat_endpoint,
                &conn.event_endpoint,
            ))
        });
        self.devices
            .insert(conn.device.clone(), conn.channel.clone());

        let record = self
            .callbacks
            .entry(conn.event_name.clone())
            .or_insert_with(|| CallbackRecord {
                device: conn.device.clone(),
                attr: conn.attr.clone(),
                event_type: conn.event_type,
                channel: conn.channel.clone(),
                event_name: conn.event_name.clone(),
                last_subscribed: Instant::now(),
                subscribers: Vec::new(),
            });
        record.last_subscribed = Instant::now();
        record.subscribers.push(Subscriber::new(id, sink, filter));
        self.ids.insert(id, conn.event_name.clone());
    }

    /// Mark a connect to `event_name` on `channel` as in flight
    pub fn begin_connect(&mut self, channel: &str, event_name: &str) {
        *self.connecting_channels.entry(channel.to_string()).or_default() += 1;
        *self.connecting_events.entry(event_name.to_string()).or_default() += 1;
    }

    /// Clear one in-flight mark set by [`Registry::begin_connect`]
    pub fn end_connect(&mut self, channel: &str, event_name: &str) {
        fn decrement(map: &mut HashMap<String, usize>, key: &str) {
            if let Some(count) = map.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    map.remove(key);
                }
            }
        }
        decrement(&mut self.connecting_channels, channel);
        decrement(&mut self.connecting_events, event_name);
    }

    pub fn is_connecting(&self, channel: &str) -> bool {
        self.connecting_channels.contains_key(channel)
    }

    /// End a connect whose links nobody will use; returns the links to drop
    pub fn abandon(&mut self, conn: &Connection) -> Teardown {
        self.end_connect(&conn.channel, &conn.event_name);
        if self.channels.contains_key(&conn.channel) {
            return self.release(&conn.channel, vec![conn.event_name.clone()]);
        }
        let mut teardown = Teardown::default();
        if !self.connecting_events.contains_key(&conn.event_name) {
            teardown
                .events
                .push((conn.event_name.clone(), conn.event_endpoint.clone()));
        }
        if !self.is_connecting(&conn.channel) {
            teardown.channel = Some((conn.channel.clone(), conn.heartbeat_endpoint.clone()));
        }
        teardown
    }

    /// Remove subscriber `id`; returns the links left without users
    pub fn remove(&mut self, id: u64) -> Option<Teardown> {
        let event_name = self.ids.remove(&id)?;
        let record = self.callbacks.get_mut(&event_name)?;
        if let Some(pos) = record.subscribers.iter().position(|s| s.id == id) {
            record.subscribers.remove(pos).deactivate();
        }
        if !record.subscribers.is_empty() {
            return Some(Teardown::default());
        }
        let record = self.callbacks.remove(&event_name)?;
        Some(self.release(&record.channel, vec![event_name]))
    }

    /// Links of `event_names` on `channel`, plus the channel itself when no
    /// callback record uses it anymore
    pub fn release(&mut self, channel: &str, event_names: Vec<String>) -> Teardown {
        let mut teardown = Teardown::default();
        let Some(record) = self.channels.get(channel) else {
            return teardown;
        };
        let status = record.status();
        teardown.events = event_names
            .into_iter()
            .filter(|name| {
                !self.callbacks.contains_key(name) && !self.connecting_events.contains_key(name)
            })
            .map(|name| (name, status.event_endpoint.clone()))
            .collect();

        if !self.callbacks.values().any(|cb| cb.channel == channel) && !self.is_connecting(channel) {
            self.channels.remove(channel);
            self.devices.retain(|_, ch| ch != channel);
            teardown.channel = Some((channel.to_string(), status.heartbeat_endpoint));
            tracing::info!(channel = %channel, "Channel torn down");
        }
        teardown
    }

    pub fn take_pending(&mut self, id: u64) -> Option<PendingSubscription> {
        let pos = self.pending.iter().position(|p| p.id == id)?;
        Some(self.pending.remove(pos))
    }

    pub fn subscriber(&self, id: u64) -> Option<&Subscriber> {
        if let Some(name) = self.ids.get(&id) {
            return self
                .callbacks
                .get(name)
                .and_then(|cb| cb.subscribers.iter().find(|s| s.id == id));
        }
        None
    }

    /// Sink of an installed or pending subscription
    pub fn sink(&self, id: u64) -> Option<&SinkHandle> {
        self.subscriber(id)
            .map(|s| &s.sink)
            .or_else(|| self.pending.iter().find(|p| p.id == id).map(|p| &p.sink))
    }

    pub fn callbacks_of<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a CallbackRecord> + 'a {
        self.callbacks.values().filter(move |cb| cb.channel == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::SubscriptionReply;
    use crate::event::{EventPayload, EventSink};
    use async_trait::async_trait;

    struct NullProxy;

    #[async_trait]
    impl AdminProxy for NullProxy {
        fn name(&self) -> &str {
            "dserver/test/1"
        }

        async fn subscription_change(
            &self,
            _command: &str,
            _request: &SubscriptionRequest,
        ) -> Result<SubscriptionReply> {
            Err(Error::connection("dserver/test/1", "null"))
        }

        async fn subscription_change_batch(
            &self,
            _command: &str,
            _requests: &[SubscriptionRequest],
        ) -> Result<SubscriptionReply> {
            Err(Error::connection("dserver/test/1", "null"))
        }

        async fn initial_event(
            &self,
            _device: &str,
            _attr: &str,
            _event_type: EventType,
        ) -> Result<EventPayload> {
            Err(Error::connection("dserver/test/1", "null"))
        }
    }

    fn conn(attr: &str) -> Connection {
        Connection {
            channel: "p/dserver/test/1".into(),
            admin_name: "dserver/test/1".into(),
            proxy: Arc::new(NullProxy),
            heartbeat_endpoint: "hb".into(),
            event_endpoint: "ev".into(),
            device: "sys/tg/1".into(),
            attr: attr.into(),
            event_type: EventType::Change,
            event_name: format!("p/sys/tg/1/{}.change", attr),
        }
    }

    fn queue() -> SinkHandle {
        SinkHandle::from_sink(EventSink::Queue(4))
    }

    #[test]
    fn test_shared_callback_record() {
        let mut reg = Registry::default();
        reg.insert(1, &conn("ampli"), queue(), None);
        reg.insert(2, &conn("ampli"), queue(), None);

        assert_eq!(reg.channels.len(), 1);
        assert_eq!(reg.callbacks.len(), 1);
        assert_eq!(reg.callbacks["p/sys/tg/1/ampli.change"].subscribers.len(), 2);
        assert_eq!(reg.devices["sys/tg/1"], "p/dserver/test/1");
    }

    #[test]
    fn test_teardown_on_last_subscriber() {
        let mut reg = Registry::default();
        reg.insert(1, &conn("ampli"), queue(), None);
        reg.insert(2, &conn("ampli"), queue(), None);
        reg.insert(3, &conn("double"), queue(), None);

        let first = reg.subscriber(1).unwrap().clone();
        assert!(reg.remove(1).unwrap().is_empty());
        assert!(!first.is_active());

        let teardown = reg.remove(2).unwrap();
        assert_eq!(
            teardown.events,
            vec![("p/sys/tg/1/ampli.change".to_string(), "ev".to_string())]
        );
        assert!(teardown.channel.is_none());

        let teardown = reg.remove(3).unwrap();
        assert_eq!(
            teardown.channel,
            Some(("p/dserver/test/1".to_string(), "hb".to_string()))
        );
        assert!(reg.channels.is_empty());
        assert!(reg.devices.is_empty());

        // second removal is a no-op
        assert!(reg.remove(3).is_none());
    }

    #[test]
    fn test_release_keeps_links_of_connect_in_flight() {
        let mut reg = Registry::default();
        reg.insert(1, &conn("ampli"), queue(), None);

        // a second subscribe to the same event has opened its links but not
        // inserted yet when the last subscriber leaves
        reg.begin_connect("p/dserver/test/1", "p/sys/tg/1/ampli.change");
        assert!(reg.remove(1).unwrap().is_empty());
        assert!(reg.channels.contains_key("p/dserver/test/1"));

        reg.insert(2, &conn("ampli"), queue(), None);
        reg.end_connect("p/dserver/test/1", "p/sys/tg/1/ampli.change");
        assert!(!reg.is_connecting("p/dserver/test/1"));

        let teardown = reg.remove(2).unwrap();
        assert_eq!(teardown.events.len(), 1);
        assert!(teardown.channel.is_some());
    }

    #[test]
    fn test_abandoned_connect_releases_channel() {
        let mut reg = Registry::default();
        reg.insert(1, &conn("ampli"), queue(), None);
        reg.begin_connect("p/dserver/test/1", "p/sys/tg/1/double.change");
        reg.remove(1);

        let teardown = reg.abandon(&conn("double"));
        assert_eq!(
            teardown.events,
            vec![("p/sys/tg/1/double.change".to_string(), "ev".to_string())]
        );
        assert_eq!(
            teardown.channel,
            Some(("p/dserver/test/1".to_string(), "hb".to_string()))
        );
        assert!(reg.channels.is_empty());

        // never registered: the links it opened go away too
        let mut empty = Registry::default();
        empty.begin_connect("p/dserver/test/1", "p/sys/tg/1/ampli.change");
        let teardown = empty.abandon(&conn("ampli"));
        assert_eq!(teardown.events.len(), 1);
        assert!(teardown.channel.is_some());
    }

    #[tokio::test]
    async fn test_lock_proxy_bounded_wait() {
        let record = ChannelRecord::new("p/ch", "ch", Arc::new(NullProxy), "hb", "ev");
        let _held = record.lock_proxy(Duration::from_millis(10)).await.unwrap();
        let err = record.lock_proxy(Duration::from_millis(10)).await;
        assert!(matches!(err, Err(Error::CommunicationFailed(_))));
    }
}
