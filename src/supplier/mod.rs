//! Publishing side
//!
//! ```text
//!  attribute layer ──► detect_and_push_events / push_*_event
//!                              │ detectors (pure)
//!                              ▼
//!                        EventSupplier ── publish mutex ──► PublisherTransport
//!                              ▲
//!  consumer ──► AdminDevice ───┘ subscription registration
//! ```

pub mod admin;
pub mod attribute;
pub mod detect;
pub mod publisher;

pub use admin::AdminDevice;
pub use attribute::AttrProperties;
pub use detect::Sample;
pub use publisher::EventSupplier;
