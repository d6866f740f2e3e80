//! Wire format
//!
//! Every event or heartbeat travels as one multi-frame message. The payload
//! frame is marshaled with a fixed binary layout in the publisher's byte
//! order; see [`cdr`] for the layout and [`message`] for the frames.

pub mod cdr;
pub mod message;
pub mod value;

pub use cdr::{CdrDecoder, CdrEncoder, Endian, Marshal};
pub use message::{CallHeader, Method, WireMessage};
pub use value::{
    AttrData, AttributeConfig, AttributeValue, ChangeThresholds, DataReady, DevError, DevState,
    ErrSeverity, EventProperties, PipeData, Quality, Threshold,
};
