//! Multi-frame event messages
//!
//! ```text
//! frame 0   fully-qualified event name (UTF-8)
//! frame 1   one byte, publisher endianness (0 = big, 1 = little)
//! frame 2   call header: i32 version, string method, u8 is_exception
//! frame 3   payload (events only)
//! ```

use bytes::Bytes;

use super::cdr::{CdrDecoder, CdrEncoder, Endian};
use crate::config::PROTOCOL_VERSION;
use crate::error::WireError;

/// Frames in an event message
pub const EVENT_FRAMES: usize = 4;

/// Frames in a heartbeat message
pub const HEARTBEAT_FRAMES: usize = 3;

/// Call header method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Event,
    Heartbeat,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Event => "event",
            Method::Heartbeat => "heartbeat",
        }
    }
}

/// Fixed-layout header of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub version: i32,
    pub method: Method,
    pub is_exception: bool,
}

impl CallHeader {
    pub fn new(method: Method, is_exception: bool) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            method,
            is_exception,
        }
    }

    fn encode(&self, endian: Endian) -> Bytes {
        let mut enc = CdrEncoder::with_endian(endian);
        enc.put_i32(self.version);
        enc.put_string(self.method.as_str());
        enc.put_bool(self.is_exception);
        enc.finish()
    }

    fn decode(data: Bytes, endian: Endian) -> Result<Self, WireError> {
        let mut dec = CdrDecoder::new(data, endian);
        let version = dec.get_i32()?;
        let method = match dec.get_string()?.as_str() {
            "event" => Method::Event,
            "heartbeat" => Method::Heartbeat,
            other => return Err(WireError::UnknownMethod(other.to_string())),
        };
        let is_exception = dec.get_bool()?;
        dec.finish()?;
        Ok(Self {
            version,
            method,
            is_exception,
        })
    }
}

/// One decoded message
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub name: String,
    pub endian: Endian,
    pub header: CallHeader,
    /// Marshaled payload, present on events only
    pub payload: Option<Bytes>,
}

impl WireMessage {
    /// Event message; `payload` must be marshaled in `endian`
    pub fn event(name: impl Into<String>, endian: Endian, payload: Bytes, is_exception: bool) -> Self {
        Self {
            name: name.into(),
            endian,
            header: CallHeader::new(Method::Event, is_exception),
            payload: Some(payload),
        }
    }

    pub fn heartbeat(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endian: Endian::native(),
            header: CallHeader::new(Method::Heartbeat, false),
            payload: None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.header.method == Method::Heartbeat
    }

    /// Split into wire frames
    pub fn to_frames(&self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(EVENT_FRAMES);
        frames.push(Bytes::copy_from_slice(self.name.as_bytes()));
        frames.push(Bytes::copy_from_slice(&[self.endian.to_byte()]));
        frames.push(self.header.encode(self.endian));
        if let Some(payload) = &self.payload {
            frames.push(payload.clone());
        }
        frames
    }

    /// Reassemble from wire frames
    pub fn from_frames(frames: Vec<Bytes>) -> Result<Self, WireError> {
        if frames.len() != EVENT_FRAMES && frames.len() != HEARTBEAT_FRAMES {
            return Err(WireError::FrameCount {
                expected: EVENT_FRAMES,
                actual: frames.len(),
            });
        }

        let mut frames = frames.into_iter();
        let mut next = || frames.next().ok_or(WireError::UnexpectedEof);

        let name = String::from_utf8(next()?.to_vec()).map_err(|_| WireError::InvalidUtf8)?;
        let endian_frame = next()?;
        if endian_frame.len() != 1 {
            return Err(WireError::UnexpectedEof);
        }
        let endian = Endian::from_byte(endian_frame[0])?;
        let header = CallHeader::decode(next()?, endian)?;
        let payload = next().ok();

        let expected = match header.method {
            Method::Event => EVENT_FRAMES,
            Method::Heartbeat => HEARTBEAT_FRAMES,
        };
        let actual = if payload.is_some() {
            EVENT_FRAMES
        } else {
            HEARTBEAT_FRAMES
        };
        if expected != actual {
            return Err(WireError::FrameCount { expected, actual });
        }

        Ok(Self {
            name,
            endian,
            header,
            payload,
        })
    }
}

/// Name frame of a frame set without decoding the rest
pub fn frame_name(frames: &[Bytes]) -> Option<&str> {
    frames.first().and_then(|f| std::str::from_utf8(f).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::cdr::encode;
    use crate::wire::value::DataReady;

    #[test]
    fn test_event_frames() {
        let payload = encode(&DataReady {
            name: "image".into(),
            data_type: 4,
            ctr: 9,
        });
        let msg = WireMessage::event(
            "evbus://localhost:10000/sys/cam/1/image.data_ready",
            Endian::native(),
            payload.clone(),
            false,
        );

        let frames = msg.to_frames();
        assert_eq!(frames.len(), EVENT_FRAMES);
        assert_eq!(&frames[1][..], &[Endian::native().to_byte()]);
        assert_eq!(frame_name(&frames), Some(msg.name.as_str()));

        let decoded = WireMessage::from_frames(frames).unwrap();
        assert_eq!(decoded, msg);
        assert!(!decoded.is_heartbeat());
        assert_eq!(decoded.header.version, PROTOCOL_VERSION);
        assert_eq!(decoded.payload, Some(payload));
    }

    #[test]
    fn test_heartbeat_frames() {
        let msg = WireMessage::heartbeat("evbus://localhost:10000/dserver/exec/1.heartbeat");
        let frames = msg.to_frames();
        assert_eq!(frames.len(), HEARTBEAT_FRAMES);

        let decoded = WireMessage::from_frames(frames).unwrap();
        assert!(decoded.is_heartbeat());
        assert!(decoded.payload.is_none());
    }

    #[test]
    fn test_big_endian_header() {
        let msg = WireMessage::event("a/b/c/d.change", Endian::Big, Bytes::new(), true);
        let frames = msg.to_frames();
        assert_eq!(&frames[2][..4], &PROTOCOL_VERSION.to_be_bytes());

        let decoded = WireMessage::from_frames(frames).unwrap();
        assert_eq!(decoded.endian, Endian::Big);
        assert!(decoded.header.is_exception);
    }

    #[test]
    fn test_wrong_frame_count() {
        let result = WireMessage::from_frames(vec![Bytes::from_static(b"x")]);
        assert_eq!(
            result,
            Err(WireError::FrameCount {
                expected: EVENT_FRAMES,
                actual: 1
            })
        );
    }

    #[test]
    fn test_event_without_payload() {
        let mut frames = WireMessage::event("a/b/c/d.change", Endian::Little, Bytes::new(), false)
            .to_frames();
        frames.pop();
        assert!(matches!(
            WireMessage::from_frames(frames),
            Err(WireError::FrameCount { .. })
        ));
    }

    #[test]
    fn test_bad_endian_byte() {
        let mut frames = WireMessage::heartbeat("x.heartbeat").to_frames();
        frames[1] = Bytes::from_static(&[9]);
        assert_eq!(
            WireMessage::from_frames(frames),
            Err(WireError::BadEndian(9))
        );
    }

    #[test]
    fn test_unknown_method() {
        let mut enc = CdrEncoder::with_endian(Endian::Little);
        enc.put_i32(PROTOCOL_VERSION);
        enc.put_string("rpc");
        enc.put_bool(false);
        let frames = vec![
            Bytes::from_static(b"x.heartbeat"),
            Bytes::from_static(&[1]),
            enc.finish(),
        ];
        assert_eq!(
            WireMessage::from_frames(frames),
            Err(WireError::UnknownMethod("rpc".into()))
        );
    }
}
