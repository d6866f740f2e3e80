//! Delivered events

use std::time::SystemTime;

use bytes::Bytes;

use super::types::EventType;
use crate::error::WireError;
use crate::wire::cdr::{decode, CdrEncoder, Endian};
use crate::wire::message::WireMessage;
use crate::wire::value::{AttributeConfig, AttributeValue, DataReady, DevError, PipeData};

/// Decoded payload of one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Value(AttributeValue),
    Config(AttributeConfig),
    DataReady(DataReady),
    Pipe(PipeData),
    Error(Vec<DevError>),
}

impl EventPayload {
    pub fn is_error(&self) -> bool {
        matches!(self, EventPayload::Error(_))
    }

    /// Marshal for the wire; returns the bytes and the is-exception flag
    pub fn marshal(&self, endian: Endian) -> (Bytes, bool) {
        let mut enc = CdrEncoder::with_endian(endian);
        match self {
            EventPayload::Value(v) => enc.put(v),
            EventPayload::Config(c) => enc.put(c),
            EventPayload::DataReady(d) => enc.put(d),
            EventPayload::Pipe(p) => enc.put(p),
            EventPayload::Error(e) => enc.put(e),
        }
        (enc.finish(), self.is_error())
    }

    /// Unmarshal the payload frame of an event of the given type
    pub fn unmarshal(
        event_type: EventType,
        data: Bytes,
        endian: Endian,
        is_exception: bool,
    ) -> Result<Self, WireError> {
        if is_exception {
            return Ok(EventPayload::Error(decode(data, endian)?));
        }
        Ok(match event_type {
            EventType::AttrConf => EventPayload::Config(decode(data, endian)?),
            EventType::DataReady => EventPayload::DataReady(decode(data, endian)?),
            EventType::Pipe => EventPayload::Pipe(decode(data, endian)?),
            _ => EventPayload::Value(decode(data, endian)?),
        })
    }
}

/// One event as delivered to a callback or stored in a queue
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub device: String,
    pub attr_name: String,
    /// Fully-qualified event name
    pub event_name: String,
    pub event_type: EventType,
    pub reception_date: SystemTime,
    pub payload: EventPayload,
}

impl EventData {
    pub fn new(
        device: impl Into<String>,
        attr_name: impl Into<String>,
        event_name: impl Into<String>,
        event_type: EventType,
        payload: EventPayload,
    ) -> Self {
        Self {
            device: device.into(),
            attr_name: attr_name.into(),
            event_name: event_name.into(),
            event_type,
            reception_date: SystemTime::now(),
            payload,
        }
    }

    /// Decode a received event message
    pub fn from_message(
        msg: WireMessage,
        device: &str,
        attr_name: &str,
        event_type: EventType,
    ) -> Result<Self, WireError> {
        let data = msg.payload.ok_or(WireError::FrameCount {
            expected: crate::wire::message::EVENT_FRAMES,
            actual: crate::wire::message::HEARTBEAT_FRAMES,
        })?;
        let payload = EventPayload::unmarshal(event_type, data, msg.endian, msg.header.is_exception)?;
        Ok(Self::new(device, attr_name, msg.name, event_type, payload))
    }

    pub fn is_error(&self) -> bool {
        self.payload.is_error()
    }

    pub fn errors(&self) -> Option<&[DevError]> {
        match &self.payload {
            EventPayload::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&AttributeValue> {
        match &self.payload {
            EventPayload::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn config(&self) -> Option<&AttributeConfig> {
        match &self.payload {
            EventPayload::Config(c) => Some(c),
            _ => None,
        }
    }

    pub fn data_ready(&self) -> Option<&DataReady> {
        match &self.payload {
            EventPayload::DataReady(d) => Some(d),
            _ => None,
        }
    }

    pub fn pipe(&self) -> Option<&PipeData> {
        match &self.payload {
            EventPayload::Pipe(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::value::Quality;

    #[test]
    fn test_value_event_from_message() {
        let value = AttributeValue::double("ampli", 4.5, Quality::Valid);
        let (bytes, exc) = EventPayload::Value(value.clone()).marshal(Endian::Little);
        assert!(!exc);

        let msg = WireMessage::event("p/sys/tg/1/ampli.change", Endian::Little, bytes, exc);
        let event = EventData::from_message(msg, "sys/tg/1", "ampli", EventType::Change).unwrap();

        assert_eq!(event.device, "sys/tg/1");
        assert_eq!(event.event_type, EventType::Change);
        assert_eq!(event.value().map(|v| &v.data), Some(&value.data));
        assert!(!event.is_error());
    }

    #[test]
    fn test_error_event_from_message() {
        let errors = vec![DevError::new("API_AttrNotAllowed", "read refused", "read_attr")];
        let (bytes, exc) = EventPayload::Error(errors.clone()).marshal(Endian::Big);
        assert!(exc);

        let msg = WireMessage::event("p/sys/tg/1/ampli.periodic", Endian::Big, bytes, exc);
        let event =
            EventData::from_message(msg, "sys/tg/1", "ampli", EventType::Periodic).unwrap();
        assert!(event.is_error());
        assert_eq!(event.errors(), Some(errors.as_slice()));
        assert!(event.value().is_none());
    }

    #[test]
    fn test_payload_kind_follows_event_type() {
        let ready = DataReady {
            name: "image".into(),
            data_type: 4,
            ctr: 2,
        };
        let (bytes, _) = EventPayload::DataReady(ready.clone()).marshal(Endian::native());
        let payload =
            EventPayload::unmarshal(EventType::DataReady, bytes.clone(), Endian::native(), false)
                .unwrap();
        assert_eq!(payload, EventPayload::DataReady(ready));

        // Same bytes read as a value payload do not decode
        assert!(EventPayload::unmarshal(EventType::Change, bytes, Endian::native(), false).is_err());
    }
}
