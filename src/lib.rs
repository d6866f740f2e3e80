//! Attribute event distribution for control-system device servers and clients
//!
//! A server process runs an [`EventSupplier`] that publishes attribute events
//! (change, quality, periodic, archive, user, configuration, data-ready, pipe)
//! and a heartbeat. Client processes run an [`EventConsumer`] that subscribes
//! through the server's admin interface, receives and decodes the events and
//! hands them to callbacks or bounded queues. A keep-alive task watches each
//! server's heartbeat and reconnects channels that go quiet.
//!
//! # Architecture
//!
//! ```text
//!   attribute layer                                       application
//!        │ push / detect                                       ▲
//!        ▼                                                     │ callback / queue
//!  ┌───────────────┐  heartbeat + event endpoints   ┌──────────────────┐
//!  │ EventSupplier │ ─────── notif hub / TCP ──────► │  EventConsumer   │
//!  └───────┬───────┘                                 │  registry        │
//!          │                                         │  keep-alive task │
//!          ▼                                         └────────┬─────────┘
//!    AdminDevice ◄──────── subscription_change ───────────────┘
//! ```
//!
//! Both sides live in an [`EventBus`] owned by the process root.
//!
//! # Example
//!
//! ```no_run
//! use evbus_rs::{Directory, EventBus, EventConfig, EventSink, EventType, TcpConfig};
//! use evbus_rs::supplier::{AdminDevice, AttrProperties};
//!
//! # async fn run() -> evbus_rs::Result<()> {
//! let bus = EventBus::new(EventConfig::tcp(TcpConfig::default()));
//! let supplier = bus.start_supplier("dserver/demo/1").await?;
//! supplier
//!     .register_attribute("sys/tg/1", "ampli", AttrProperties::pushed("ampli"))
//!     .await;
//!
//! let directory = Directory::new();
//! directory.register_server(AdminDevice::new(supplier.clone()), &["sys/tg/1"]).await;
//!
//! let consumer = bus.start_consumer(directory).await?;
//! let id = consumer
//!     .subscribe_event("sys/tg/1", "ampli", EventType::Change, EventSink::Queue(16), &[], false)
//!     .await?;
//! let events = consumer.get_events(id).await?;
//! # let _ = events;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod stats;
pub mod supplier;
pub mod transport;
pub mod wire;

pub use admin::{AdminProxy, AdminResolver, Directory, SubscriptionReply, SubscriptionRequest};
pub use bus::EventBus;
pub use config::{EventConfig, TcpConfig, TransportConfig};
pub use consumer::{ChannelState, EventConsumer, KeepAliveCommand};
pub use error::{Error, Result, WireError};
pub use event::{ChannelCallback, EventCallback, EventData, EventPayload, EventSink, EventType};
pub use supplier::EventSupplier;
pub use transport::{NotifHub, TransportKind};
