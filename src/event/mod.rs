//! Event model shared by suppliers and consumers
//!
//! Event types and names, decoded event data, subscription filters, the
//! bounded event queue and the sinks events are delivered to.

pub mod callback;
pub mod data;
pub mod filter;
pub mod queue;
pub mod types;

pub use callback::{ChannelCallback, EventCallback, EventSink};
pub use data::{EventData, EventPayload};
pub use filter::EventFilter;
pub use queue::EventQueue;
pub use types::EventType;
