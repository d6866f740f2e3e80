//! Publisher admin interface
//!
//! The consumer never talks to a device directly to set up events. It asks a
//! resolver which server process hosts the device, then calls that server's
//! admin interface to register the subscription and learn the endpoints to
//! connect to. [`Directory`] is an in-process resolver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::event::{EventPayload, EventType};

/// Action carried by every registration request
pub const ACTION_SUBSCRIBE: &str = "subscribe";

/// One subscription registration: (device, attribute, action, event type)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub device: String,
    pub attr: String,
    pub action: String,
    pub event_type: EventType,
}

impl SubscriptionRequest {
    pub fn subscribe(device: &str, attr: &str, event_type: EventType) -> Self {
        Self {
            device: device.to_lowercase(),
            attr: attr.to_lowercase(),
            action: ACTION_SUBSCRIBE.to_string(),
            event_type,
        }
    }
}

/// Registration reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionReply {
    pub lib_version: i32,
    pub protocol_version: i32,
    pub heartbeat_endpoint: String,
    pub event_endpoint: String,
}

/// Admin interface of one publisher process
#[async_trait]
pub trait AdminProxy: Send + Sync {
    /// Admin name, e.g. `dserver/exec/inst`
    fn name(&self) -> &str;

    /// Register one subscription; `command` names the transport-specific command
    async fn subscription_change(
        &self,
        command: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionReply>;

    /// Renew several subscriptions in one call
    ///
    /// Succeeds when the server is reachable and accepts the command;
    /// individual requests that fail their preconditions are skipped.
    async fn subscription_change_batch(
        &self,
        command: &str,
        requests: &[SubscriptionRequest],
    ) -> Result<SubscriptionReply>;

    /// Current state of a subscription target, used for the first event
    async fn initial_event(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
    ) -> Result<EventPayload>;
}

/// Locates the admin interface serving a device
#[async_trait]
pub trait AdminResolver: Send + Sync {
    async fn admin_name(&self, device: &str) -> Result<String>;

    async fn connect_admin(&self, admin_name: &str) -> Result<Arc<dyn AdminProxy>>;
}

struct ServerEntry {
    proxy: Arc<dyn AdminProxy>,
    reachable: Arc<AtomicBool>,
}

/// In-process device and server directory
pub struct Directory {
    devices: RwLock<HashMap<String, String>>,
    servers: RwLock<HashMap<String, ServerEntry>>,
    rpc_count: Arc<AtomicU64>,
}

impl Directory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            rpc_count: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Register a server's admin interface and the devices it hosts
    ///
    /// Replaces any previous registration under the same admin name.
    pub async fn register_server(&self, proxy: Arc<dyn AdminProxy>, devices: &[&str]) {
        let admin = proxy.name().to_lowercase();
        {
            let mut map = self.devices.write().await;
            for device in devices {
                map.insert(device.to_lowercase(), admin.clone());
            }
        }
        self.servers.write().await.insert(
            admin.clone(),
            ServerEntry {
                proxy,
                reachable: Arc::new(AtomicBool::new(true)),
            },
        );
        tracing::debug!(admin = %admin, devices = devices.len(), "Server registered");
    }

    /// Declare that `device` is hosted by `admin_name`
    pub async fn add_device(&self, device: &str, admin_name: &str) {
        self.devices
            .write()
            .await
            .insert(device.to_lowercase(), admin_name.to_lowercase());
    }

    pub async fn unregister_server(&self, admin_name: &str) {
        self.servers.write().await.remove(&admin_name.to_lowercase());
    }

    /// Make every call to a server fail (or succeed again)
    ///
    /// Proxies handed out earlier follow the flag too.
    pub async fn set_reachable(&self, admin_name: &str, reachable: bool) {
        if let Some(entry) = self.servers.read().await.get(&admin_name.to_lowercase()) {
            entry.reachable.store(reachable, Ordering::Release);
        }
    }

    /// Registration calls made through this directory (single and batch)
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AdminResolver for Directory {
    async fn admin_name(&self, device: &str) -> Result<String> {
        self.devices
            .read()
            .await
            .get(&device.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                Error::precondition("API_DeviceNotFound", format!("device {} not defined", device))
            })
    }

    async fn connect_admin(&self, admin_name: &str) -> Result<Arc<dyn AdminProxy>> {
        let servers = self.servers.read().await;
        let entry = servers
            .get(&admin_name.to_lowercase())
            .ok_or_else(|| Error::connection(admin_name, "server not running"))?;
        if !entry.reachable.load(Ordering::Acquire) {
            return Err(Error::connection(admin_name, "server unreachable"));
        }
        Ok(Arc::new(DirectoryProxy {
            inner: Arc::clone(&entry.proxy),
            reachable: Arc::clone(&entry.reachable),
            rpc_count: Arc::clone(&self.rpc_count),
        }))
    }
}

/// Proxy handed out by the directory; honours the reachability flag
struct DirectoryProxy {
    inner: Arc<dyn AdminProxy>,
    reachable: Arc<AtomicBool>,
    rpc_count: Arc<AtomicU64>,
}

impl DirectoryProxy {
    fn check(&self) -> Result<()> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::connection(self.inner.name(), "server unreachable"))
        }
    }
}

#[async_trait]
impl AdminProxy for DirectoryProxy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn subscription_change(
        &self,
        command: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionReply> {
        self.check()?;
        self.rpc_count.fetch_add(1, Ordering::Relaxed);
        self.inner.subscription_change(command, request).await
    }

    async fn subscription_change_batch(
        &self,
        command: &str,
        requests: &[SubscriptionRequest],
    ) -> Result<SubscriptionReply> {
        self.check()?;
        self.rpc_count.fetch_add(1, Ordering::Relaxed);
        self.inner.subscription_change_batch(command, requests).await
    }

    async fn initial_event(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
    ) -> Result<EventPayload> {
        self.check()?;
        self.inner.initial_event(device, attr, event_type).await
    }
}
