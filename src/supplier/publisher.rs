//! Event supplier
//!
//! Publishing side of the bus: encodes events and heartbeats, runs the
//! detectors on values handed in by the attribute layer, and answers the
//! admin interface's subscription registrations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};

use super::attribute::{AttrProperties, AttributeEntry};
use super::detect::{
    detect_archive_change, detect_change, detect_periodic, detect_quality, Reference, Sample,
};
use crate::admin::{SubscriptionReply, SubscriptionRequest, ACTION_SUBSCRIBE};
use crate::config::{EventConfig, LIB_VERSION, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::event::types::{channel_name, event_name, heartbeat_name};
use crate::event::{EventPayload, EventType};
use crate::stats::{SupplierMetrics, SupplierStats};
use crate::transport::{self, PublisherTransport, Stream, TransportKind};
use crate::wire::cdr::Endian;
use crate::wire::message::WireMessage;
use crate::wire::value::{AttributeConfig, DataReady, PipeData};

/// Period of periodic events when the attribute configures none
pub const DEFAULT_PERIODIC_PERIOD: Duration = Duration::from_secs(1);

type AttrKey = (String, String);

fn key(device: &str, attr: &str) -> AttrKey {
    (device.to_lowercase(), attr.to_lowercase())
}

/// State guarded by the publish mutex
struct PublishState {
    last_heartbeat: Option<Instant>,
}

/// Publishing side of one server process
pub struct EventSupplier {
    admin_name: String,
    heartbeat_name: String,
    config: EventConfig,
    transport: Arc<dyn PublisherTransport>,

    /// Registered attributes
    attributes: RwLock<HashMap<AttrKey, Arc<Mutex<AttributeEntry>>>>,

    /// Serializes every message put on the transport
    publish: Mutex<PublishState>,

    shutting_down: AtomicBool,
    metrics: SupplierMetrics,
    heartbeat_task: std::sync::Mutex<Option<AbortHandle>>,
}

impl EventSupplier {
    /// Bind the publisher endpoints for server `admin_name`
    pub async fn start(config: EventConfig, admin_name: &str) -> Result<Arc<Self>> {
        let admin_name = admin_name.to_lowercase();
        let transport =
            transport::bind_publisher(&config.transport, &admin_name, config.publish_capacity)
                .await
                .map_err(|e| {
                    tracing::error!(admin = %admin_name, error = %e, "Failed to bind event endpoints");
                    e
                })?;

        tracing::info!(
            admin = %admin_name,
            heartbeat = %transport.heartbeat_endpoint(),
            event = %transport.event_endpoint(),
            "Event supplier started"
        );

        Ok(Arc::new(Self {
            heartbeat_name: heartbeat_name(&channel_name(&config.fqdn_prefix, &admin_name)),
            admin_name,
            config,
            transport,
            attributes: RwLock::new(HashMap::new()),
            publish: Mutex::new(PublishState {
                last_heartbeat: None,
            }),
            shutting_down: AtomicBool::new(false),
            metrics: SupplierMetrics::new(),
            heartbeat_task: std::sync::Mutex::new(None),
        }))
    }

    pub fn admin_name(&self) -> &str {
        &self.admin_name
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn heartbeat_endpoint(&self) -> &str {
        self.transport.heartbeat_endpoint()
    }

    pub fn event_endpoint(&self) -> &str {
        self.transport.event_endpoint()
    }

    pub fn stats(&self) -> SupplierStats {
        self.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Register (or replace) an attribute served by this process
    pub async fn register_attribute(&self, device: &str, attr: &str, props: AttrProperties) {
        let mut attributes = self.attributes.write().await;
        attributes.insert(key(device, attr), Arc::new(Mutex::new(AttributeEntry::new(props))));
        tracing::debug!(device = %device, attr = %attr, "Attribute registered");
    }

    async fn entry(&self, device: &str, attr: &str) -> Result<Arc<Mutex<AttributeEntry>>> {
        let key = key(device, attr);
        let attributes = self.attributes.read().await;
        if let Some(entry) = attributes.get(&key) {
            return Ok(Arc::clone(entry));
        }
        if attributes.keys().any(|(d, _)| *d == key.0) {
            Err(Error::precondition(
                "API_AttrNotFound",
                format!("attribute {} not found on {}", attr, device),
            ))
        } else {
            Err(Error::precondition(
                "API_DeviceNotFound",
                format!("device {} not served by {}", device, self.admin_name),
            ))
        }
    }

    /// Validate and record one subscription registration
    pub async fn subscribe(&self, request: &SubscriptionRequest) -> Result<SubscriptionReply> {
        if self.is_shutting_down() {
            return Err(Error::precondition(
                "API_ShutdownInProgress",
                format!("{} is shutting down", self.admin_name),
            ));
        }
        if request.action != ACTION_SUBSCRIBE {
            return Err(Error::precondition(
                "API_WrongAction",
                format!("unsupported action {:?}", request.action),
            ));
        }

        let entry = self.entry(&request.device, &request.attr).await?;
        let mut entry = entry.lock().await;
        check_preconditions(&entry.props, request)?;
        entry
            .state
            .record_subscription(request.event_type, Instant::now());
        SupplierMetrics::incr(&self.metrics.subscriptions);

        tracing::debug!(
            device = %request.device,
            attr = %request.attr,
            event = %request.event_type,
            "Subscription registered"
        );

        Ok(self.reply())
    }

    fn reply(&self) -> SubscriptionReply {
        SubscriptionReply {
            lib_version: LIB_VERSION,
            protocol_version: PROTOCOL_VERSION,
            heartbeat_endpoint: self.heartbeat_endpoint().to_string(),
            event_endpoint: self.event_endpoint().to_string(),
        }
    }

    /// Endpoint reply without registering anything
    pub(crate) fn endpoints(&self) -> SubscriptionReply {
        self.reply()
    }

    /// Current state of a subscription target
    pub async fn initial_event(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
    ) -> Result<EventPayload> {
        let entry = self.entry(device, attr).await?;
        let entry = entry.lock().await;
        match event_type {
            EventType::AttrConf => Ok(EventPayload::Config(entry.props.config.clone())),
            EventType::DataReady => Ok(EventPayload::DataReady(DataReady {
                name: attr.to_string(),
                data_type: data_type_of(entry.state.last_sample.as_ref()),
                ctr: entry.state.data_ready_ctr,
            })),
            EventType::Pipe => Err(Error::precondition(
                "API_PipeValueNotSet",
                format!("no pipe value for {}/{}", device, attr),
            )),
            _ => match &entry.state.last_sample {
                Some(Ok(v)) => Ok(EventPayload::Value(v.clone())),
                Some(Err(errors)) => Ok(EventPayload::Error(errors.clone())),
                None => Err(Error::precondition(
                    "API_AttrValueNotSet",
                    format!("no value read yet for {}/{}", device, attr),
                )),
            },
        }
    }

    /// Encode and publish one event
    ///
    /// Publish failures are logged and the event dropped; returns whether the
    /// event went out.
    pub async fn push_event(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
        payload: &EventPayload,
    ) -> bool {
        let name = event_name(&self.config.fqdn_prefix, device, attr, event_type);
        let endian = Endian::native();
        let (bytes, is_exception) = payload.marshal(endian);
        let frames = WireMessage::event(name.as_str(), endian, bytes, is_exception).to_frames();

        let _guard = self.publish.lock().await;
        match self.transport.publish(Stream::Event, frames).await {
            Ok(()) => {
                SupplierMetrics::incr(&self.metrics.events_pushed);
                tracing::debug!(event = %name, error = is_exception, "Event pushed");
                true
            }
            Err(e) => {
                SupplierMetrics::incr(&self.metrics.push_failures);
                tracing::warn!(event = %name, error = %e, "Event push failed, dropped");
                false
            }
        }
    }

    /// Publish a heartbeat unless the last one is too recent
    pub async fn push_heartbeat_event(&self) -> bool {
        let mut state = self.publish.lock().await;
        let now = Instant::now();
        if let Some(last) = state.last_heartbeat {
            if now.saturating_duration_since(last) < self.config.heartbeat_min_interval() {
                return false;
            }
        }

        let frames = WireMessage::heartbeat(self.heartbeat_name.as_str()).to_frames();
        match self.transport.publish(Stream::Heartbeat, frames).await {
            Ok(()) => {
                state.last_heartbeat = Some(now);
                SupplierMetrics::incr(&self.metrics.heartbeats_sent);
                tracing::trace!(admin = %self.admin_name, "Heartbeat sent");
                true
            }
            Err(e) => {
                tracing::warn!(admin = %self.admin_name, error = %e, "Heartbeat push failed");
                false
            }
        }
    }

    /// Spawn the task sending heartbeats every period
    pub fn spawn_heartbeat_task(self: &Arc<Self>) -> JoinHandle<()> {
        let supplier = Arc::clone(self);
        let period = self.config.heartbeat_period;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if supplier.is_shutting_down() {
                    break;
                }
                supplier.push_heartbeat_event().await;
            }
        });

        let mut slot = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle.abort_handle()) {
            old.abort();
        }
        handle
    }

    fn subscribed(&self, entry: &AttributeEntry, event_type: EventType, now: Instant) -> bool {
        entry
            .state
            .is_subscribed(event_type, now, self.config.resubscribe_period)
    }

    /// Run the change, quality, periodic and archive detectors on a polled
    /// sample and push what fires
    ///
    /// Only event types registered within the resubscribe period are
    /// considered. Returns the fired types.
    pub async fn detect_and_push_events(
        &self,
        device: &str,
        attr: &str,
        sample: Sample,
    ) -> Result<Vec<EventType>> {
        let entry = self.entry(device, attr).await?;
        let mut entry = entry.lock().await;
        let now = Instant::now();
        let mut fired = Vec::new();

        if self.subscribed(&entry, EventType::Change, now)
            && detect_change(
                &entry.state.change_ref,
                &sample,
                &entry.props.config.events.change,
                false,
            )
        {
            entry.state.change_ref = Reference::of(&sample);
            fired.push(EventType::Change);
        }

        if self.subscribed(&entry, EventType::Quality, now)
            && detect_quality(&entry.state.quality_ref, &sample)
        {
            entry.state.quality_ref = Reference::of(&sample);
            fired.push(EventType::Quality);
        }

        if self.subscribed(&entry, EventType::Periodic, now) {
            let period = entry
                .props
                .config
                .events
                .period
                .unwrap_or(DEFAULT_PERIODIC_PERIOD);
            if detect_periodic(entry.state.last_periodic, now, period) {
                entry.state.last_periodic = Some(now);
                fired.push(EventType::Periodic);
            }
        }

        if self.subscribed(&entry, EventType::Archive, now) && self.detect_archive(&mut entry, &sample, now) {
            fired.push(EventType::Archive);
        }

        entry.state.last_sample = Some(sample.clone());

        let payload = payload_of(sample);
        for event_type in &fired {
            self.push_event(device, attr, *event_type, &payload).await;
        }
        Ok(fired)
    }

    /// Archive fires on threshold crossing or when the archive period elapses
    fn detect_archive(&self, entry: &mut AttributeEntry, sample: &Sample, now: Instant) -> bool {
        let events = &entry.props.config.events;
        let on_change = detect_archive_change(&entry.state.archive_ref, sample, &events.archive);
        let on_period = match events.archive_period {
            Some(period) => {
                entry.state.last_archive_periodic.is_some()
                    && detect_periodic(entry.state.last_archive_periodic, now, period)
            }
            None => false,
        };
        if on_change || on_period {
            entry.state.archive_ref = Reference::of(sample);
            entry.state.last_archive_periodic = Some(now);
            true
        } else {
            false
        }
    }

    /// Change event pushed by code; goes through the detector when the
    /// attribute checks criteria
    pub async fn push_change_event(&self, device: &str, attr: &str, sample: Sample) -> Result<bool> {
        let entry = self.entry(device, attr).await?;
        let mut entry = entry.lock().await;
        let now = Instant::now();
        if !self.subscribed(&entry, EventType::Change, now) {
            entry.state.last_sample = Some(sample);
            return Ok(false);
        }

        let force = !entry.props.check_criteria;
        let fire = detect_change(
            &entry.state.change_ref,
            &sample,
            &entry.props.config.events.change,
            force,
        );
        entry.state.last_sample = Some(sample.clone());
        if !fire {
            return Ok(false);
        }
        entry.state.change_ref = Reference::of(&sample);
        Ok(self
            .push_event(device, attr, EventType::Change, &payload_of(sample))
            .await)
    }

    /// Archive event pushed by code
    pub async fn push_archive_event(&self, device: &str, attr: &str, sample: Sample) -> Result<bool> {
        let entry = self.entry(device, attr).await?;
        let mut entry = entry.lock().await;
        let now = Instant::now();
        entry.state.last_sample = Some(sample.clone());
        if !self.subscribed(&entry, EventType::Archive, now) {
            return Ok(false);
        }

        let fire = !entry.props.check_criteria || self.detect_archive(&mut entry, &sample, now);
        if !fire {
            return Ok(false);
        }
        entry.state.archive_ref = Reference::of(&sample);
        Ok(self
            .push_event(device, attr, EventType::Archive, &payload_of(sample))
            .await)
    }

    /// User event, always pushed when subscribed
    pub async fn push_user_event(&self, device: &str, attr: &str, sample: Sample) -> Result<bool> {
        self.push_when_subscribed(device, attr, EventType::User, payload_of(sample))
            .await
    }

    /// Push the attribute's current configuration
    pub async fn push_att_conf_event(&self, device: &str, attr: &str) -> Result<bool> {
        let config = {
            let entry = self.entry(device, attr).await?;
            let entry = entry.lock().await;
            entry.props.config.clone()
        };
        self.push_when_subscribed(device, attr, EventType::AttrConf, EventPayload::Config(config))
            .await
    }

    /// Replace an attribute's configuration and notify `attr_conf` subscribers
    pub async fn set_attribute_config(
        &self,
        device: &str,
        attr: &str,
        config: AttributeConfig,
    ) -> Result<bool> {
        {
            let entry = self.entry(device, attr).await?;
            let mut entry = entry.lock().await;
            entry.props.config = config;
        }
        self.push_att_conf_event(device, attr).await
    }

    /// Signal new data; returns the attribute's new counter
    pub async fn push_data_ready_event(&self, device: &str, attr: &str) -> Result<i32> {
        let entry = self.entry(device, attr).await?;
        let mut entry = entry.lock().await;
        if !entry.props.data_ready_enabled {
            return Err(Error::precondition(
                "API_AttributeNotDataReadyEnabled",
                format!("{}/{} is not data ready enabled", device, attr),
            ));
        }
        entry.state.data_ready_ctr = entry.state.data_ready_ctr.wrapping_add(1);
        let ctr = entry.state.data_ready_ctr;

        if self.subscribed(&entry, EventType::DataReady, Instant::now()) {
            let payload = EventPayload::DataReady(DataReady {
                name: attr.to_string(),
                data_type: data_type_of(entry.state.last_sample.as_ref()),
                ctr,
            });
            self.push_event(device, attr, EventType::DataReady, &payload)
                .await;
        }
        Ok(ctr)
    }

    /// Push a pipe blob
    pub async fn push_pipe_event(&self, device: &str, pipe: &str, data: PipeData) -> Result<bool> {
        self.push_when_subscribed(device, pipe, EventType::Pipe, EventPayload::Pipe(data))
            .await
    }

    async fn push_when_subscribed(
        &self,
        device: &str,
        attr: &str,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<bool> {
        let entry = self.entry(device, attr).await?;
        let entry = entry.lock().await;
        if !self.subscribed(&entry, event_type, Instant::now()) {
            return Ok(false);
        }
        Ok(self.push_event(device, attr, event_type, &payload).await)
    }

    /// Stop heartbeats, refuse new subscriptions and release the endpoints
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.transport.close().await;
        tracing::info!(admin = %self.admin_name, "Event supplier stopped");
    }
}

fn check_preconditions(props: &AttrProperties, request: &SubscriptionRequest) -> Result<()> {
    let name = format!("{}/{}", request.device, request.attr);
    let not_polled = || {
        Error::precondition(
            "API_AttributePollingNotStarted",
            format!("{} is not polled", name),
        )
    };
    let not_set = |what: &str| {
        Error::precondition(
            "API_EventPropertiesNotSet",
            format!("{} not set for {}", what, name),
        )
    };
    let events = &props.config.events;

    match request.event_type {
        EventType::Change => {
            if !props.polled && !props.change_pushed_by_code {
                return Err(not_polled());
            }
            if props.check_criteria && props.numeric && !events.change.is_configured() {
                return Err(not_set("abs_change and rel_change"));
            }
        }
        EventType::Archive => {
            if !props.polled && !props.archive_pushed_by_code {
                return Err(not_polled());
            }
            if props.check_criteria
                && props.numeric
                && !events.archive.is_configured()
                && events.archive_period.is_none()
            {
                return Err(not_set("archive_abs_change, archive_rel_change and archive_period"));
            }
        }
        EventType::Periodic | EventType::Quality => {
            if !props.polled {
                return Err(not_polled());
            }
        }
        EventType::DataReady => {
            if !props.data_ready_enabled {
                return Err(Error::precondition(
                    "API_AttributeNotDataReadyEnabled",
                    format!("{} is not data ready enabled", name),
                ));
            }
        }
        EventType::User | EventType::AttrConf | EventType::Pipe => {}
    }
    Ok(())
}

fn payload_of(sample: Sample) -> EventPayload {
    match sample {
        Ok(v) => EventPayload::Value(v),
        Err(errors) => EventPayload::Error(errors),
    }
}

fn data_type_of(sample: Option<&Sample>) -> i32 {
    match sample {
        Some(Ok(v)) => v.data.tag() as i32,
        _ => 0,
    }
}
