//! Per-attribute event state on the supplier

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::detect::{Reference, Sample};
use crate::event::EventType;
use crate::wire::value::{AttributeConfig, ChangeThresholds};

/// Static event properties of one attribute, supplied by the attribute layer
#[derive(Debug, Clone, Default)]
pub struct AttrProperties {
    /// Configuration, including change/archive thresholds and periods
    pub config: AttributeConfig,

    /// Attribute is polled, so detectors run on every poll
    pub polled: bool,

    /// Code pushes change events itself
    pub change_pushed_by_code: bool,

    /// Code pushes archive events itself
    pub archive_pushed_by_code: bool,

    /// Pushed change/archive events go through the detectors
    pub check_criteria: bool,

    /// Code signals data-ready events
    pub data_ready_enabled: bool,

    /// Data is numeric, so change events need thresholds
    pub numeric: bool,
}

impl AttrProperties {
    /// Properties of a polled attribute with default configuration
    pub fn polled(name: &str) -> Self {
        Self {
            config: AttributeConfig {
                name: name.to_string(),
                label: name.to_string(),
                ..Default::default()
            },
            polled: true,
            check_criteria: true,
            numeric: true,
            ..Default::default()
        }
    }

    /// Properties of an attribute whose events are all pushed by code
    pub fn pushed(name: &str) -> Self {
        Self {
            polled: false,
            change_pushed_by_code: true,
            archive_pushed_by_code: true,
            check_criteria: false,
            ..Self::polled(name)
        }
    }

    pub fn with_config(mut self, config: AttributeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_data_ready(mut self) -> Self {
        self.data_ready_enabled = true;
        self
    }

    /// Mark the data as non-numeric (string, boolean, state, encoded)
    pub fn non_numeric(mut self) -> Self {
        self.numeric = false;
        self
    }

    /// Set change thresholds
    pub fn change(mut self, thresholds: ChangeThresholds) -> Self {
        self.config.events.change = thresholds;
        self
    }

    /// Set archive thresholds
    pub fn archive(mut self, thresholds: ChangeThresholds) -> Self {
        self.config.events.archive = thresholds;
        self
    }

    /// Set the archive event period
    pub fn archive_period(mut self, period: Duration) -> Self {
        self.config.events.archive_period = Some(period);
        self
    }

    /// Set the periodic event period
    pub fn period(mut self, period: Duration) -> Self {
        self.config.events.period = Some(period);
        self
    }
}

/// Mutable event state of one attribute
#[derive(Debug, Default)]
pub struct AttributeEventState {
    pub change_ref: Reference,
    pub archive_ref: Reference,
    pub quality_ref: Reference,
    pub last_periodic: Option<Instant>,
    pub last_archive_periodic: Option<Instant>,
    pub data_ready_ctr: i32,
    /// Last sample seen, for initial events
    pub last_sample: Option<Sample>,
    /// Last registration time per event type
    subscriptions: HashMap<EventType, Instant>,
}

impl AttributeEventState {
    pub fn record_subscription(&mut self, event_type: EventType, now: Instant) {
        self.subscriptions.insert(event_type, now);
    }

    /// Whether `event_type` was registered within `period`
    pub fn is_subscribed(&self, event_type: EventType, now: Instant, period: Duration) -> bool {
        self.subscriptions
            .get(&event_type)
            .map(|t| now.saturating_duration_since(*t) <= period)
            .unwrap_or(false)
    }
}

/// One registered attribute
#[derive(Debug)]
pub struct AttributeEntry {
    pub props: AttrProperties,
    pub state: AttributeEventState,
}

impl AttributeEntry {
    pub fn new(props: AttrProperties) -> Self {
        Self {
            props,
            state: AttributeEventState::default(),
        }
    }
}
