//! In-process notification hub transport
//!
//! The hub is a broker shared by every bus of the process: publishers bind
//! named endpoints backed by broadcast channels, consumers open receivers on
//! them. Endpoint names are `inproc://<admin name>/heartbeat` and
//! `inproc://<admin name>/event`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;

use super::link::{FrameSource, LinkTable};
use super::{ConsumerTransport, Inbound, PublisherTransport, Stream, TransportKind};
use crate::error::{Error, Result};

const DEFAULT_HUB_CAPACITY: usize = 1024;

type Message = Vec<Bytes>;

/// Process-wide notification broker
pub struct NotifHub {
    endpoints: RwLock<HashMap<String, broadcast::Sender<Message>>>,
    capacity: usize,
}

impl NotifHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    /// Hub whose endpoints buffer `capacity` messages per slow receiver
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    async fn bind(&self, endpoint: &str) -> Result<broadcast::Sender<Message>> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(endpoint) {
            return Err(Error::EventSystemFailed(format!(
                "endpoint {} already bound",
                endpoint
            )));
        }
        let (tx, _) = broadcast::channel(self.capacity);
        endpoints.insert(endpoint.to_string(), tx.clone());
        tracing::debug!(endpoint = %endpoint, "Hub endpoint bound");
        Ok(tx)
    }

    async fn unbind(&self, endpoint: &str) {
        if self.endpoints.write().await.remove(endpoint).is_some() {
            tracing::debug!(endpoint = %endpoint, "Hub endpoint unbound");
        }
    }

    async fn open(&self, endpoint: &str) -> Result<broadcast::Receiver<Message>> {
        self.endpoints
            .read()
            .await
            .get(endpoint)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::connection(endpoint, "no such hub endpoint"))
    }

    /// Number of bound endpoints
    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }
}

/// Endpoint name of one publisher stream
fn endpoint_name(admin_name: &str, stream: Stream) -> String {
    let suffix = match stream {
        Stream::Heartbeat => "heartbeat",
        Stream::Event => "event",
    };
    format!("inproc://{}/{}", admin_name.to_lowercase(), suffix)
}

/// Publisher bound on the hub
pub struct NotifPublisher {
    hub: Arc<NotifHub>,
    heartbeat_endpoint: String,
    event_endpoint: String,
    /// Heartbeat and event senders, taken on close
    senders: Mutex<Option<(broadcast::Sender<Message>, broadcast::Sender<Message>)>>,
}

impl NotifPublisher {
    pub async fn bind(hub: Arc<NotifHub>, admin_name: &str) -> Result<Self> {
        let heartbeat_endpoint = endpoint_name(admin_name, Stream::Heartbeat);
        let event_endpoint = endpoint_name(admin_name, Stream::Event);

        let heartbeat_tx = hub.bind(&heartbeat_endpoint).await?;
        let event_tx = match hub.bind(&event_endpoint).await {
            Ok(tx) => tx,
            Err(e) => {
                hub.unbind(&heartbeat_endpoint).await;
                return Err(e);
            }
        };

        Ok(Self {
            hub,
            heartbeat_endpoint,
            event_endpoint,
            senders: Mutex::new(Some((heartbeat_tx, event_tx))),
        })
    }
}

#[async_trait]
impl PublisherTransport for NotifPublisher {
    fn kind(&self) -> TransportKind {
        TransportKind::Notif
    }

    fn heartbeat_endpoint(&self) -> &str {
        &self.heartbeat_endpoint
    }

    fn event_endpoint(&self) -> &str {
        &self.event_endpoint
    }

    async fn publish(&self, stream: Stream, frames: Vec<Bytes>) -> Result<()> {
        let tx = {
            let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
            match (senders.as_ref(), stream) {
                (Some((hb, _)), Stream::Heartbeat) => hb.clone(),
                (Some((_, ev)), Stream::Event) => ev.clone(),
                (None, _) => return Err(Error::CommunicationFailed("publisher closed".into())),
            }
        };
        // Err only means nobody is listening
        let _ = tx.send(frames);
        Ok(())
    }

    async fn close(&self) {
        let taken = self
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if taken.is_none() {
            return;
        }
        self.hub.unbind(&self.heartbeat_endpoint).await;
        self.hub.unbind(&self.event_endpoint).await;
    }
}

struct HubSource {
    endpoint: String,
    rx: broadcast::Receiver<Message>,
}

#[async_trait]
impl FrameSource for HubSource {
    async fn next_frames(&mut self) -> Option<Vec<Bytes>> {
        loop {
            match self.rx.recv().await {
                Ok(frames) => return Some(frames),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(endpoint = %self.endpoint, skipped = n, "Consumer lagging, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Consumer attached to the hub
pub struct NotifConsumer {
    hub: Arc<NotifHub>,
    links: LinkTable,
}

impl NotifConsumer {
    pub fn new(hub: Arc<NotifHub>, inbound: Inbound) -> Self {
        Self {
            hub,
            links: LinkTable::new(inbound),
        }
    }

    async fn attach(&self, endpoint: &str, name: &str) -> Result<()> {
        let hub = Arc::clone(&self.hub);
        self.links
            .attach(endpoint, name, || async move {
                let rx = hub.open(endpoint).await?;
                Ok(HubSource {
                    endpoint: endpoint.to_string(),
                    rx,
                })
            })
            .await
    }
}

#[async_trait]
impl ConsumerTransport for NotifConsumer {
    fn kind(&self) -> TransportKind {
        TransportKind::Notif
    }

    async fn connect_channel(&self, channel: &str, heartbeat_endpoint: &str) -> Result<()> {
        self.attach(heartbeat_endpoint, &crate::event::types::heartbeat_name(channel))
            .await
    }

    async fn disconnect_channel(&self, channel: &str, heartbeat_endpoint: &str) {
        self.links
            .detach(heartbeat_endpoint, &crate::event::types::heartbeat_name(channel))
            .await;
    }

    async fn connect_event(&self, event_name: &str, endpoint: &str) -> Result<()> {
        self.attach(endpoint, event_name).await
    }

    async fn disconnect_event(&self, event_name: &str, endpoint: &str) {
        self.links.detach(endpoint, event_name).await;
    }

    async fn close(&self) {
        self.links.close_all().await;
    }
}
