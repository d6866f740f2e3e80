//! Event payload value types
//!
//! Everything a publisher can put in the payload frame of an event message:
//! attribute values, attribute configuration, data-ready descriptors, pipe
//! blobs and error lists.

use std::time::{Duration, SystemTime};

use bytes::Bytes;

/// Attribute value quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    Valid,
    Invalid,
    Alarm,
    Changing,
    Warning,
}

impl Quality {
    /// Numeric code used on the wire and in filters
    pub fn code(self) -> u32 {
        match self {
            Quality::Valid => 0,
            Quality::Invalid => 1,
            Quality::Alarm => 2,
            Quality::Changing => 3,
            Quality::Warning => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Quality::Valid,
            1 => Quality::Invalid,
            2 => Quality::Alarm,
            3 => Quality::Changing,
            4 => Quality::Warning,
            _ => return None,
        })
    }
}

/// Device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevState {
    On,
    Off,
    Close,
    Open,
    Insert,
    Extract,
    Moving,
    Standby,
    Fault,
    Init,
    Running,
    Alarm,
    Disable,
    Unknown,
}

impl DevState {
    const ALL: [DevState; 14] = [
        DevState::On,
        DevState::Off,
        DevState::Close,
        DevState::Open,
        DevState::Insert,
        DevState::Extract,
        DevState::Moving,
        DevState::Standby,
        DevState::Fault,
        DevState::Init,
        DevState::Running,
        DevState::Alarm,
        DevState::Disable,
        DevState::Unknown,
    ];

    pub fn code(self) -> u32 {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(13) as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

/// Attribute data, always carried as a sequence (scalars have one element)
#[derive(Debug, Clone, PartialEq)]
pub enum AttrData {
    Boolean(Vec<bool>),
    Long(Vec<i32>),
    Long64(Vec<i64>),
    Double(Vec<f64>),
    String(Vec<String>),
    State(Vec<DevState>),
    Encoded { format: String, data: Bytes },
}

impl AttrData {
    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            AttrData::Boolean(v) => v.len(),
            AttrData::Long(v) => v.len(),
            AttrData::Long64(v) => v.len(),
            AttrData::Double(v) => v.len(),
            AttrData::String(v) => v.len(),
            AttrData::State(v) => v.len(),
            AttrData::Encoded { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether threshold based change detection applies to this data
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            AttrData::Long(_) | AttrData::Long64(_) | AttrData::Double(_)
        )
    }

    /// Numeric elements widened to f64, or None for non-numeric data
    pub fn as_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            AttrData::Long(v) => Some(v.iter().map(|x| *x as f64).collect()),
            AttrData::Long64(v) => Some(v.iter().map(|x| *x as f64).collect()),
            AttrData::Double(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// First element as a number, if there is a sensible numeric reading
    pub fn first_f64(&self) -> Option<f64> {
        match self {
            AttrData::Boolean(v) => v.first().map(|b| if *b { 1.0 } else { 0.0 }),
            AttrData::Long(v) => v.first().map(|x| *x as f64),
            AttrData::Long64(v) => v.first().map(|x| *x as f64),
            AttrData::Double(v) => v.first().copied(),
            AttrData::State(v) => v.first().map(|s| s.code() as f64),
            AttrData::String(_) | AttrData::Encoded { .. } => None,
        }
    }

    pub(crate) fn tag(&self) -> u32 {
        match self {
            AttrData::Boolean(_) => 1,
            AttrData::Long(_) => 2,
            AttrData::Long64(_) => 3,
            AttrData::Double(_) => 4,
            AttrData::String(_) => 5,
            AttrData::State(_) => 6,
            AttrData::Encoded { .. } => 7,
        }
    }
}

/// One attribute reading
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValue {
    pub name: String,
    pub data: AttrData,
    pub quality: Quality,
    pub time: SystemTime,
    pub dim_x: u32,
    pub dim_y: u32,
}

impl AttributeValue {
    /// Scalar double reading stamped now
    pub fn double(name: impl Into<String>, value: f64, quality: Quality) -> Self {
        Self::new(name, AttrData::Double(vec![value]), quality)
    }

    /// Reading stamped now; dimensions follow the data length
    pub fn new(name: impl Into<String>, data: AttrData, quality: Quality) -> Self {
        let dim_x = data.len() as u32;
        Self {
            name: name.into(),
            data,
            quality,
            time: SystemTime::now(),
            dim_x,
            dim_y: 0,
        }
    }

    pub fn with_time(mut self, time: SystemTime) -> Self {
        self.time = time;
        self
    }
}

/// Change threshold; the two sides are the allowed downward and upward deltas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub down: f64,
    pub up: f64,
}

impl Threshold {
    pub fn symmetric(limit: f64) -> Self {
        Self {
            down: limit.abs(),
            up: limit.abs(),
        }
    }

    pub fn asymmetric(down: f64, up: f64) -> Self {
        Self {
            down: down.abs(),
            up: up.abs(),
        }
    }

    /// Whether a signed delta reaches this threshold on either side
    pub fn is_reached(&self, delta: f64) -> bool {
        (delta > 0.0 && delta >= self.up) || (delta < 0.0 && -delta >= self.down)
    }
}

/// Absolute and relative change limits
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChangeThresholds {
    pub abs: Option<Threshold>,
    /// Relative change in percent of the reference value
    pub rel: Option<Threshold>,
}

impl ChangeThresholds {
    pub fn abs(limit: f64) -> Self {
        Self {
            abs: Some(Threshold::symmetric(limit)),
            rel: None,
        }
    }

    pub fn rel(percent: f64) -> Self {
        Self {
            abs: None,
            rel: Some(Threshold::symmetric(percent)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.abs.is_some() || self.rel.is_some()
    }
}

/// Event related attribute properties
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventProperties {
    pub change: ChangeThresholds,
    pub archive: ChangeThresholds,
    pub period: Option<Duration>,
    pub archive_period: Option<Duration>,
}

/// Attribute configuration, the payload of `attr_conf` events
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeConfig {
    pub name: String,
    pub label: String,
    pub unit: String,
    pub format: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub events: EventProperties,
}

/// Payload of `data_ready` events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReady {
    pub name: String,
    pub data_type: i32,
    pub ctr: i32,
}

/// Payload of `pipe` events
#[derive(Debug, Clone, PartialEq)]
pub struct PipeData {
    pub name: String,
    pub time: SystemTime,
    pub elements: Vec<(String, AttrData)>,
}

/// Error severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrSeverity {
    Warn,
    Err,
    Panic,
}

impl ErrSeverity {
    pub fn code(self) -> u32 {
        match self {
            ErrSeverity::Warn => 0,
            ErrSeverity::Err => 1,
            ErrSeverity::Panic => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ErrSeverity::Warn,
            1 => ErrSeverity::Err,
            2 => ErrSeverity::Panic,
            _ => return None,
        })
    }
}

/// One entry of an error list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevError {
    pub reason: String,
    pub desc: String,
    pub origin: String,
    pub severity: ErrSeverity,
}

impl DevError {
    pub fn new(reason: impl Into<String>, desc: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            desc: desc.into(),
            origin: origin.into(),
            severity: ErrSeverity::Err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_codes() {
        for q in [
            Quality::Valid,
            Quality::Invalid,
            Quality::Alarm,
            Quality::Changing,
            Quality::Warning,
        ] {
            assert_eq!(Quality::from_code(q.code()), Some(q));
        }
        assert_eq!(Quality::from_code(5), None);
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(DevState::On.code(), 0);
        assert_eq!(DevState::Unknown.code(), 13);
        assert_eq!(DevState::from_code(8), Some(DevState::Fault));
        assert_eq!(DevState::from_code(14), None);
    }

    #[test]
    fn test_threshold_sides() {
        let t = Threshold::asymmetric(1.0, 5.0);
        assert!(t.is_reached(5.0));
        assert!(!t.is_reached(4.9));
        assert!(t.is_reached(-1.0));
        assert!(!t.is_reached(-0.5));
        assert!(!t.is_reached(0.0));
    }

    #[test]
    fn test_numeric_views() {
        let data = AttrData::Long(vec![3, 4]);
        assert!(data.is_numeric());
        assert_eq!(data.as_f64_vec(), Some(vec![3.0, 4.0]));
        assert_eq!(data.first_f64(), Some(3.0));

        let text = AttrData::String(vec!["a".into()]);
        assert!(!text.is_numeric());
        assert_eq!(text.as_f64_vec(), None);
        assert_eq!(text.first_f64(), None);

        assert_eq!(AttrData::Boolean(vec![true]).first_f64(), Some(1.0));
    }

    #[test]
    fn test_value_dimensions() {
        let v = AttributeValue::new("spectrum", AttrData::Double(vec![1.0, 2.0, 3.0]), Quality::Valid);
        assert_eq!(v.dim_x, 3);
        assert_eq!(v.dim_y, 0);
    }
}
