//! Payload marshaling
//!
//! A fixed-layout binary encoding in the publisher's byte order. The
//! endianness travels in its own frame; the decoder swaps when needed.
//!
//! ```text
//! bool / u8      1 byte
//! u32 / i32      4 bytes
//! i64 / f64      8 bytes
//! string         u32 length + UTF-8 bytes
//! sequence<T>    u32 count + elements
//! optional<T>    u8 present flag + T
//! time           i64 seconds + i32 microseconds since the Unix epoch
//! AttrData       u32 tag + sequence (tag 7: format string + byte string)
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{
    AttrData, AttributeConfig, AttributeValue, ChangeThresholds, DataReady, DevError, DevState,
    ErrSeverity, EventProperties, PipeData, Quality, Threshold,
};
use crate::error::WireError;

/// Preallocation cap for decoded sequences (counts come from the peer)
const MAX_PREALLOC: usize = 1024;

/// Byte order of a marshaled payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    /// Byte order of this host
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            Endian::Little
        } else {
            Endian::Big
        }
    }

    /// Value of the endianness frame (0 = big, 1 = little)
    pub fn to_byte(self) -> u8 {
        match self {
            Endian::Big => 0,
            Endian::Little => 1,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(Endian::Big),
            1 => Ok(Endian::Little),
            other => Err(WireError::BadEndian(other)),
        }
    }
}

/// Payload encoder
pub struct CdrEncoder {
    buf: BytesMut,
    endian: Endian,
}

impl CdrEncoder {
    /// Encoder writing in host byte order
    pub fn new() -> Self {
        Self::with_endian(Endian::native())
    }

    pub fn with_endian(endian: Endian) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            endian,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Take the encoded bytes and reset the encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.endian {
            Endian::Big => self.buf.put_u32(v),
            Endian::Little => self.buf.put_u32_le(v),
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        match self.endian {
            Endian::Big => self.buf.put_i32(v),
            Endian::Little => self.buf.put_i32_le(v),
        }
    }

    pub fn put_i64(&mut self, v: i64) {
        match self.endian {
            Endian::Big => self.buf.put_i64(v),
            Endian::Little => self.buf.put_i64_le(v),
        }
    }

    pub fn put_f64(&mut self, v: f64) {
        match self.endian {
            Endian::Big => self.buf.put_f64(v),
            Endian::Little => self.buf.put_f64_le(v),
        }
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.buf.put_slice(b);
    }

    pub fn put_opt_f64(&mut self, v: Option<f64>) {
        self.put_bool(v.is_some());
        if let Some(v) = v {
            self.put_f64(v);
        }
    }

    pub fn put_time(&mut self, t: SystemTime) {
        let (secs, usec) = match t.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_micros() as i32),
            Err(e) => {
                let d = e.duration();
                (-(d.as_secs() as i64), -(d.subsec_micros() as i32))
            }
        };
        self.put_i64(secs);
        self.put_i32(usec);
    }

    /// Marshal any payload type
    pub fn put<T: Marshal>(&mut self, value: &T) {
        value.marshal(self);
    }
}

impl Default for CdrEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload decoder
pub struct CdrDecoder {
    buf: Bytes,
    endian: Endian,
}

impl CdrDecoder {
    pub fn new(buf: Bytes, endian: Endian) -> Self {
        Self { buf, endian }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fail unless the whole buffer was consumed
    pub fn finish(&self) -> Result<(), WireError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            Err(WireError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(match self.endian {
            Endian::Big => self.buf.get_u32(),
            Endian::Little => self.buf.get_u32_le(),
        })
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(match self.endian {
            Endian::Big => self.buf.get_i32(),
            Endian::Little => self.buf.get_i32_le(),
        })
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        self.need(8)?;
        Ok(match self.endian {
            Endian::Big => self.buf.get_i64(),
            Endian::Little => self.buf.get_i64_le(),
        })
    }

    pub fn get_f64(&mut self) -> Result<f64, WireError> {
        self.need(8)?;
        Ok(match self.endian {
            Endian::Big => self.buf.get_f64(),
            Endian::Little => self.buf.get_f64_le(),
        })
    }

    pub fn get_bytes(&mut self) -> Result<Bytes, WireError> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn get_opt_f64(&mut self) -> Result<Option<f64>, WireError> {
        if self.get_bool()? {
            Ok(Some(self.get_f64()?))
        } else {
            Ok(None)
        }
    }

    pub fn get_time(&mut self) -> Result<SystemTime, WireError> {
        let secs = self.get_i64()?;
        let usec = self.get_i32()?;
        if secs >= 0 && usec >= 0 {
            Ok(UNIX_EPOCH + Duration::new(secs as u64, (usec as u32).min(999_999) * 1000))
        } else {
            let back = Duration::new(secs.unsigned_abs(), usec.unsigned_abs().min(999_999) * 1000);
            Ok(UNIX_EPOCH - back)
        }
    }

    /// Read a sequence count, rejecting counts the buffer cannot hold
    pub fn get_count(&mut self, min_elem_size: usize) -> Result<usize, WireError> {
        let count = self.get_u32()? as usize;
        if count.saturating_mul(min_elem_size) > self.buf.remaining() {
            return Err(WireError::UnexpectedEof);
        }
        Ok(count)
    }

    fn get_seq<T>(
        &mut self,
        min_elem_size: usize,
        mut f: impl FnMut(&mut Self) -> Result<T, WireError>,
    ) -> Result<Vec<T>, WireError> {
        let count = self.get_count(min_elem_size)?;
        let mut out = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            out.push(f(self)?);
        }
        Ok(out)
    }

    /// Unmarshal any payload type
    pub fn get<T: Marshal>(&mut self) -> Result<T, WireError> {
        T::unmarshal(self)
    }
}

/// Types that can travel in a payload frame
pub trait Marshal: Sized {
    fn marshal(&self, enc: &mut CdrEncoder);
    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError>;
}

impl Marshal for AttrData {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put_u32(self.tag());
        match self {
            AttrData::Boolean(v) => {
                enc.put_u32(v.len() as u32);
                v.iter().for_each(|b| enc.put_bool(*b));
            }
            AttrData::Long(v) => {
                enc.put_u32(v.len() as u32);
                v.iter().for_each(|x| enc.put_i32(*x));
            }
            AttrData::Long64(v) => {
                enc.put_u32(v.len() as u32);
                v.iter().for_each(|x| enc.put_i64(*x));
            }
            AttrData::Double(v) => {
                enc.put_u32(v.len() as u32);
                v.iter().for_each(|x| enc.put_f64(*x));
            }
            AttrData::String(v) => {
                enc.put_u32(v.len() as u32);
                v.iter().for_each(|s| enc.put_string(s));
            }
            AttrData::State(v) => {
                enc.put_u32(v.len() as u32);
                v.iter().for_each(|s| enc.put_u32(s.code()));
            }
            AttrData::Encoded { format, data } => {
                enc.put_string(format);
                enc.put_bytes(data);
            }
        }
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        let tag = dec.get_u32()?;
        Ok(match tag {
            1 => AttrData::Boolean(dec.get_seq(1, |d| d.get_bool())?),
            2 => AttrData::Long(dec.get_seq(4, |d| d.get_i32())?),
            3 => AttrData::Long64(dec.get_seq(8, |d| d.get_i64())?),
            4 => AttrData::Double(dec.get_seq(8, |d| d.get_f64())?),
            5 => AttrData::String(dec.get_seq(4, |d| d.get_string())?),
            6 => AttrData::State(dec.get_seq(4, |d| {
                let code = d.get_u32()?;
                DevState::from_code(code).ok_or(WireError::UnknownTag(code))
            })?),
            7 => AttrData::Encoded {
                format: dec.get_string()?,
                data: dec.get_bytes()?,
            },
            other => return Err(WireError::UnknownTag(other)),
        })
    }
}

impl Marshal for AttributeValue {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put_string(&self.name);
        enc.put_u32(self.quality.code());
        enc.put_time(self.time);
        enc.put_u32(self.dim_x);
        enc.put_u32(self.dim_y);
        enc.put(&self.data);
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        let name = dec.get_string()?;
        let code = dec.get_u32()?;
        let quality = Quality::from_code(code).ok_or(WireError::UnknownTag(code))?;
        let time = dec.get_time()?;
        let dim_x = dec.get_u32()?;
        let dim_y = dec.get_u32()?;
        let data = dec.get()?;
        Ok(Self {
            name,
            data,
            quality,
            time,
            dim_x,
            dim_y,
        })
    }
}

impl Marshal for ChangeThresholds {
    fn marshal(&self, enc: &mut CdrEncoder) {
        for t in [self.abs, self.rel] {
            enc.put_bool(t.is_some());
            if let Some(t) = t {
                enc.put_f64(t.down);
                enc.put_f64(t.up);
            }
        }
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        let mut read = |dec: &mut CdrDecoder| -> Result<Option<Threshold>, WireError> {
            if dec.get_bool()? {
                let down = dec.get_f64()?;
                let up = dec.get_f64()?;
                Ok(Some(Threshold::asymmetric(down, up)))
            } else {
                Ok(None)
            }
        };
        let abs = read(dec)?;
        let rel = read(dec)?;
        Ok(Self { abs, rel })
    }
}

impl Marshal for EventProperties {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put(&self.change);
        enc.put(&self.archive);
        // periods travel in milliseconds, 0 meaning not set
        enc.put_u32(self.period.map(|p| p.as_millis() as u32).unwrap_or(0));
        enc.put_u32(self.archive_period.map(|p| p.as_millis() as u32).unwrap_or(0));
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        let change = dec.get()?;
        let archive = dec.get()?;
        let period = match dec.get_u32()? {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };
        let archive_period = match dec.get_u32()? {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };
        Ok(Self {
            change,
            archive,
            period,
            archive_period,
        })
    }
}

impl Marshal for AttributeConfig {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put_string(&self.name);
        enc.put_string(&self.label);
        enc.put_string(&self.unit);
        enc.put_string(&self.format);
        enc.put_opt_f64(self.min_value);
        enc.put_opt_f64(self.max_value);
        enc.put(&self.events);
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        Ok(Self {
            name: dec.get_string()?,
            label: dec.get_string()?,
            unit: dec.get_string()?,
            format: dec.get_string()?,
            min_value: dec.get_opt_f64()?,
            max_value: dec.get_opt_f64()?,
            events: dec.get()?,
        })
    }
}

impl Marshal for DataReady {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put_string(&self.name);
        enc.put_i32(self.data_type);
        enc.put_i32(self.ctr);
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        Ok(Self {
            name: dec.get_string()?,
            data_type: dec.get_i32()?,
            ctr: dec.get_i32()?,
        })
    }
}

impl Marshal for PipeData {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put_string(&self.name);
        enc.put_time(self.time);
        enc.put_u32(self.elements.len() as u32);
        for (name, data) in &self.elements {
            enc.put_string(name);
            enc.put(data);
        }
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        let name = dec.get_string()?;
        let time = dec.get_time()?;
        let elements = dec.get_seq(8, |d| Ok((d.get_string()?, d.get()?)))?;
        Ok(Self {
            name,
            time,
            elements,
        })
    }
}

impl Marshal for DevError {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put_string(&self.reason);
        enc.put_string(&self.desc);
        enc.put_string(&self.origin);
        enc.put_u32(self.severity.code());
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        let reason = dec.get_string()?;
        let desc = dec.get_string()?;
        let origin = dec.get_string()?;
        let code = dec.get_u32()?;
        let severity = ErrSeverity::from_code(code).ok_or(WireError::UnknownTag(code))?;
        Ok(Self {
            reason,
            desc,
            origin,
            severity,
        })
    }
}

impl Marshal for Vec<DevError> {
    fn marshal(&self, enc: &mut CdrEncoder) {
        enc.put_u32(self.len() as u32);
        for e in self {
            enc.put(e);
        }
    }

    fn unmarshal(dec: &mut CdrDecoder) -> Result<Self, WireError> {
        dec.get_seq(16, |d| d.get())
    }
}

/// Encode one value in host byte order
pub fn encode<T: Marshal>(value: &T) -> Bytes {
    let mut enc = CdrEncoder::new();
    enc.put(value);
    enc.finish()
}

/// Decode one value, requiring the buffer to be fully consumed
pub fn decode<T: Marshal>(data: Bytes, endian: Endian) -> Result<T, WireError> {
    let mut dec = CdrDecoder::new(data, endian);
    let value = dec.get()?;
    dec.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn other(endian: Endian) -> Endian {
        match endian {
            Endian::Big => Endian::Little,
            Endian::Little => Endian::Big,
        }
    }

    #[test]
    fn test_endian_byte() {
        assert_eq!(Endian::from_byte(0), Ok(Endian::Big));
        assert_eq!(Endian::from_byte(1), Ok(Endian::Little));
        assert_eq!(Endian::from_byte(7), Err(WireError::BadEndian(7)));
    }

    #[test]
    fn test_foreign_byte_order() {
        // A big-endian publisher talking to any host
        let mut enc = CdrEncoder::with_endian(Endian::Big);
        enc.put_u32(0x0102_0304);
        let bytes = enc.finish();
        assert_eq!(&bytes[..], &[1, 2, 3, 4]);

        let mut dec = CdrDecoder::new(bytes.clone(), Endian::Big);
        assert_eq!(dec.get_u32().unwrap(), 0x0102_0304);

        // Reading with the wrong flag swaps the bytes
        let mut wrong = CdrDecoder::new(bytes, other(Endian::Big));
        assert_eq!(wrong.get_u32().unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_attribute_value_both_orders() {
        let value = AttributeValue::new(
            "temperature",
            AttrData::Double(vec![21.5, 22.0]),
            Quality::Alarm,
        );

        for endian in [Endian::Big, Endian::Little] {
            let mut enc = CdrEncoder::with_endian(endian);
            enc.put(&value);
            let decoded: AttributeValue = decode(enc.finish(), endian).unwrap();
            assert_eq!(decoded.name, "temperature");
            assert_eq!(decoded.data, value.data);
            assert_eq!(decoded.quality, Quality::Alarm);
            assert_eq!(decoded.dim_x, 2);
            // microsecond resolution on the wire
            let delta = match decoded.time.duration_since(value.time) {
                Ok(d) => d,
                Err(e) => e.duration(),
            };
            assert!(delta < Duration::from_micros(1));
        }
    }

    #[test]
    fn test_pre_epoch_time() {
        let t = UNIX_EPOCH - Duration::new(10, 500_000_000);
        let mut enc = CdrEncoder::new();
        enc.put_time(t);
        let mut dec = CdrDecoder::new(enc.finish(), Endian::native());
        assert_eq!(dec.get_time().unwrap(), t);
    }

    #[test]
    fn test_config_with_thresholds() {
        let config = AttributeConfig {
            name: "current".into(),
            label: "Beam current".into(),
            unit: "mA".into(),
            format: "%6.2f".into(),
            min_value: Some(0.0),
            max_value: None,
            events: EventProperties {
                change: ChangeThresholds {
                    abs: Some(Threshold::asymmetric(1.0, 2.0)),
                    rel: None,
                },
                archive: ChangeThresholds::rel(5.0),
                period: Some(Duration::from_millis(1000)),
                archive_period: None,
            },
        };
        let decoded: AttributeConfig = decode(encode(&config), Endian::native()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_error_list() {
        let errors = vec![
            DevError::new("API_AttrValueNotSet", "no value", "read_attr"),
            DevError {
                reason: "API_Panic".into(),
                desc: String::new(),
                origin: "x".into(),
                severity: ErrSeverity::Panic,
            },
        ];
        let decoded: Vec<DevError> = decode(encode(&errors), Endian::native()).unwrap();
        assert_eq!(decoded, errors);
    }

    #[test]
    fn test_encoded_and_state_data() {
        let data = AttrData::Encoded {
            format: "jpeg".into(),
            data: Bytes::from_static(&[0xFF, 0xD8]),
        };
        let decoded: AttrData = decode(encode(&data), Endian::native()).unwrap();
        assert_eq!(decoded, data);

        let states = AttrData::State(vec![DevState::On, DevState::Fault]);
        let decoded: AttrData = decode(encode(&states), Endian::native()).unwrap();
        assert_eq!(decoded, states);
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = encode(&DataReady {
            name: "image".into(),
            data_type: 5,
            ctr: 3,
        });
        let truncated = bytes.slice(..bytes.len() - 2);
        let result: Result<DataReady, _> = decode(truncated, Endian::native());
        assert_eq!(result, Err(WireError::UnexpectedEof));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut enc = CdrEncoder::new();
        enc.put(&DataReady {
            name: "a".into(),
            data_type: 1,
            ctr: 1,
        });
        enc.put_u8(0);
        let result: Result<DataReady, _> = decode(enc.finish(), Endian::native());
        assert_eq!(result, Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn test_huge_count_rejected_without_allocation() {
        let mut enc = CdrEncoder::new();
        enc.put_u32(4); // Double tag
        enc.put_u32(u32::MAX);
        let result: Result<AttrData, _> = decode(enc.finish(), Endian::native());
        assert_eq!(result, Err(WireError::UnexpectedEof));
    }

    #[test]
    fn test_unknown_data_tag() {
        let mut enc = CdrEncoder::new();
        enc.put_u32(99);
        let result: Result<AttrData, _> = decode(enc.finish(), Endian::native());
        assert_eq!(result, Err(WireError::UnknownTag(99)));
    }
}
