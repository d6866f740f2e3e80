//! Receiving side
//!
//! ```text
//!  links ──► mpsc ──► receive task ──► dispatch ──► filter ──► callback / queue
//!                                         │ read lock
//!                                         ▼
//!  subscribe / unsubscribe ──────────► Registry ◄──── keep-alive task
//!                          write lock     ▲            (heartbeat scan,
//!                                         │             reconnect, renew,
//!  unsubscribe from a callback ──► deferred worker      pending retry)
//! ```

#[allow(clippy::module_inception)]
pub mod consumer;
pub mod deferred;
pub mod keepalive;
pub mod registry;

pub use consumer::EventConsumer;
pub use keepalive::{KeepAliveCommand, EVENT_TIMEOUT_REASON};
pub use registry::ChannelState;
