//! Event types and fully-qualified names

use std::fmt;
use std::str::FromStr;

use crate::error::WireError;

/// Suffix of heartbeat message names
pub const HEARTBEAT_SUFFIX: &str = "heartbeat";

/// Kind of event a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Change,
    Quality,
    Periodic,
    Archive,
    User,
    AttrConf,
    DataReady,
    Pipe,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::Change,
        EventType::Quality,
        EventType::Periodic,
        EventType::Archive,
        EventType::User,
        EventType::AttrConf,
        EventType::DataReady,
        EventType::Pipe,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Change => "change",
            EventType::Quality => "quality",
            EventType::Periodic => "periodic",
            EventType::Archive => "archive",
            EventType::User => "user_event",
            EventType::AttrConf => "attr_conf",
            EventType::DataReady => "data_ready",
            EventType::Pipe => "pipe",
        }
    }

    /// Whether the payload is an attribute value
    pub fn carries_value(self) -> bool {
        matches!(
            self,
            EventType::Change
                | EventType::Quality
                | EventType::Periodic
                | EventType::Archive
                | EventType::User
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| WireError::InvalidEventName(s.to_string()))
    }
}

/// `<prefix><device>/<attr>.<type>`, lower-cased
pub fn event_name(prefix: &str, device: &str, attr: &str, event_type: EventType) -> String {
    format!(
        "{}{}/{}.{}",
        prefix,
        device.to_lowercase(),
        attr.to_lowercase(),
        event_type.as_str()
    )
}

/// Channel name of a publisher: `<prefix><admin>`
pub fn channel_name(prefix: &str, admin_name: &str) -> String {
    format!("{}{}", prefix, admin_name.to_lowercase())
}

/// Heartbeat name of a channel: `<channel>.heartbeat`
pub fn heartbeat_name(channel: &str) -> String {
    format!("{}.{}", channel, HEARTBEAT_SUFFIX)
}

/// Channel name carried by a heartbeat message name
pub fn channel_of_heartbeat(name: &str) -> Option<&str> {
    name.strip_suffix(HEARTBEAT_SUFFIX)
        .and_then(|rest| rest.strip_suffix('.'))
}

/// Components of a fully-qualified event name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventName<'a> {
    pub device: &'a str,
    pub attr: &'a str,
    pub event_type: EventType,
}

/// Split a fully-qualified event name built with `prefix`
pub fn parse_event_name<'a>(prefix: &str, name: &'a str) -> Result<EventName<'a>, WireError> {
    let invalid = || WireError::InvalidEventName(name.to_string());
    let rest = name.strip_prefix(prefix).ok_or_else(invalid)?;
    let (path, suffix) = rest.rsplit_once('.').ok_or_else(invalid)?;
    let (device, attr) = path.rsplit_once('/').ok_or_else(invalid)?;
    if device.is_empty() || attr.is_empty() {
        return Err(invalid());
    }
    Ok(EventName {
        device,
        attr,
        event_type: suffix.parse().map_err(|_| invalid())?,
    })
}
