//! Event sinks

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::data::EventData;
use super::queue::EventQueue;

/// Receiver of pushed events
///
/// Called on the consumer's receive task, in arrival order. A slow callback
/// delays every other delivery on the same transport.
#[async_trait]
pub trait EventCallback: Send + Sync {
    async fn push_event(&self, event: EventData);
}

/// Where a subscription delivers its events
#[derive(Clone)]
pub enum EventSink {
    /// Invoke a callback for every event
    Callback(Arc<dyn EventCallback>),
    /// Store events in a bounded queue of the given capacity
    Queue(usize),
}

impl EventSink {
    pub fn callback(cb: impl EventCallback + 'static) -> Self {
        EventSink::Callback(Arc::new(cb))
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSink::Callback(_) => f.write_str("Callback"),
            EventSink::Queue(n) => f.debug_tuple("Queue").field(n).finish(),
        }
    }
}

/// Live sink held by a subscriber
#[derive(Clone)]
pub(crate) enum SinkHandle {
    Callback(Arc<dyn EventCallback>),
    Queue(Arc<Mutex<EventQueue>>),
}

impl SinkHandle {
    pub(crate) fn from_sink(sink: EventSink) -> Self {
        match sink {
            EventSink::Callback(cb) => SinkHandle::Callback(cb),
            EventSink::Queue(capacity) => {
                SinkHandle::Queue(Arc::new(Mutex::new(EventQueue::new(capacity))))
            }
        }
    }

    /// Deliver one event; queue inserts never block on the consumer
    pub(crate) async fn deliver(&self, event: EventData) {
        match self {
            SinkHandle::Callback(cb) => cb.push_event(event).await,
            SinkHandle::Queue(queue) => {
                if let Ok(mut q) = queue.lock() {
                    q.insert_event(event);
                }
            }
        }
    }

    pub(crate) fn queue(&self) -> Option<&Arc<Mutex<EventQueue>>> {
        match self {
            SinkHandle::Queue(q) => Some(q),
            SinkHandle::Callback(_) => None,
        }
    }
}

/// Callback that forwards events into a tokio channel
///
/// Handy for tests and for applications that prefer a stream of events.
pub struct ChannelCallback {
    tx: tokio::sync::mpsc::UnboundedSender<EventData>,
}

impl ChannelCallback {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<EventData>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventCallback for ChannelCallback {
    async fn push_event(&self, event: EventData) {
        let _ = self.tx.send(event);
    }
}
