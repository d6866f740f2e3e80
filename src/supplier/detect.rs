//! Event detectors
//!
//! Pure functions of the last fired reference, the new sample and the
//! attribute's static configuration. They never touch the transport.

use std::time::{Duration, Instant};

use crate::wire::value::{AttrData, AttributeValue, ChangeThresholds, DevError, Quality};

/// A reading handed to the detectors: a value, or the errors the read raised
pub type Sample = std::result::Result<AttributeValue, Vec<DevError>>;

/// Periods from which the tolerance becomes relative
const RELATIVE_TOLERANCE_FROM: Duration = Duration::from_secs(5);

/// Tolerance for short periods
const FIXED_TOLERANCE: Duration = Duration::from_millis(100);

/// What the last fired event carried
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Reference {
    /// Nothing fired yet
    #[default]
    Empty,
    Value { data: AttrData, quality: Quality },
    /// Reason of the first error
    Error(String),
}

impl Reference {
    pub fn of(sample: &Sample) -> Self {
        match sample {
            Ok(v) => Reference::Value {
                data: v.data.clone(),
                quality: v.quality,
            },
            Err(errors) => Reference::Error(first_reason(errors)),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Reference::Empty)
    }
}

fn first_reason(errors: &[DevError]) -> String {
    errors.first().map(|e| e.reason.clone()).unwrap_or_default()
}

/// Transitions every detector fires on: first sample, error changes,
/// value/error switches. `None` means the values must be compared.
fn transition(reference: &Reference, sample: &Sample) -> Option<bool> {
    match (reference, sample) {
        (Reference::Empty, _) => Some(true),
        (Reference::Error(old), Err(errors)) => Some(*old != first_reason(errors)),
        (Reference::Error(_), Ok(_)) | (Reference::Value { .. }, Err(_)) => Some(true),
        (Reference::Value { quality, .. }, Ok(v)) if *quality != v.quality => Some(true),
        (Reference::Value { .. }, Ok(_)) => None,
    }
}

/// Change (and archive) detection
///
/// Fires on force, on any transition, when no threshold is configured, or
/// when one element crosses an absolute or relative threshold. The relative
/// delta is in percent and only computed against a non-zero reference.
pub fn detect_change(
    reference: &Reference,
    sample: &Sample,
    thresholds: &ChangeThresholds,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    if let Some(fire) = transition(reference, sample) {
        return fire;
    }
    let (old, new) = match (reference, sample) {
        (Reference::Value { data, quality }, Ok(v)) => {
            // an invalid value has nothing to compare
            if *quality == Quality::Invalid {
                return false;
            }
            (data, &v.data)
        }
        _ => return false,
    };

    let (old_nums, new_nums) = match (old.as_f64_vec(), new.as_f64_vec()) {
        (Some(o), Some(n)) => (o, n),
        // non-numeric data fires on any difference
        _ => return old != new,
    };
    if old_nums.len() != new_nums.len() {
        return true;
    }
    if !thresholds.is_configured() {
        return true;
    }

    old_nums.iter().zip(new_nums.iter()).any(|(o, n)| {
        let delta = n - o;
        let abs_hit = thresholds.abs.map(|t| t.is_reached(delta)).unwrap_or(false);
        let rel_hit = match thresholds.rel {
            Some(t) if *o != 0.0 => t.is_reached(delta * 100.0 / o.abs()),
            _ => false,
        };
        abs_hit || rel_hit
    })
}

/// Archive detection on values
///
/// Change detection against the archive thresholds, except that numeric
/// data without archive thresholds only fires on transitions and length
/// changes: the archive period drives it.
pub fn detect_archive_change(
    reference: &Reference,
    sample: &Sample,
    thresholds: &ChangeThresholds,
) -> bool {
    let numeric = matches!(sample, Ok(v) if v.data.is_numeric());
    if !numeric || thresholds.is_configured() {
        return detect_change(reference, sample, thresholds, false);
    }
    match (transition(reference, sample), reference, sample) {
        (Some(fire), _, _) => fire,
        (None, Reference::Value { data, .. }, Ok(v)) => data.len() != v.data.len(),
        _ => false,
    }
}

/// Quality detection: fires when the quality differs from the last pushed one
pub fn detect_quality(reference: &Reference, sample: &Sample) -> bool {
    transition(reference, sample).unwrap_or(false)
}

/// Early-fire tolerance for a period
pub fn periodic_tolerance(period: Duration) -> Duration {
    if period >= RELATIVE_TOLERANCE_FROM {
        period * 2 / 100
    } else {
        FIXED_TOLERANCE
    }
}

/// Periodic detection: at most once per period, within tolerance
pub fn detect_periodic(last_fired: Option<Instant>, now: Instant, period: Duration) -> bool {
    match last_fired {
        None => true,
        Some(last) => now.saturating_duration_since(last) + periodic_tolerance(period) >= period,
    }
}
