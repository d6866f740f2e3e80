//! Bounded per-subscription event queue

use std::collections::VecDeque;
use std::time::SystemTime;

use super::data::EventData;

/// Fixed-capacity FIFO of received events
///
/// Inserting into a full queue evicts the oldest entry first.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<EventData>,
    max_elt: usize,
    last_event_date: Option<SystemTime>,
}

impl EventQueue {
    /// Create a queue; a capacity of 0 is treated as 1
    pub fn new(max_elt: usize) -> Self {
        let max_elt = max_elt.max(1);
        Self {
            events: VecDeque::with_capacity(max_elt.min(1024)),
            max_elt,
            last_event_date: None,
        }
    }

    pub fn insert_event(&mut self, event: EventData) {
        if self.events.len() >= self.max_elt {
            self.events.pop_front();
        }
        self.last_event_date = Some(event.reception_date);
        self.events.push_back(event);
    }

    /// Drain every stored event in arrival order
    pub fn get_events(&mut self) -> Vec<EventData> {
        self.events.drain(..).collect()
    }

    /// Reception date of the most recent insert, kept after draining
    pub fn get_last_event_date(&self) -> Option<SystemTime> {
        self.last_event_date
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_elt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::data::EventPayload;
    use crate::event::types::EventType;
    use crate::wire::value::{AttributeValue, Quality};

    fn event(n: f64) -> EventData {
        EventData::new(
            "sys/tg/1",
            "ampli",
            "p/sys/tg/1/ampli.change",
            EventType::Change,
            EventPayload::Value(AttributeValue::double("ampli", n, Quality::Valid)),
        )
    }

    fn reading(e: &EventData) -> f64 {
        e.value().and_then(|v| v.data.first_f64()).unwrap()
    }

    #[test]
    fn test_evicts_oldest() {
        let mut queue = EventQueue::new(3);
        for n in 0..4 {
            queue.insert_event(event(n as f64));
        }
        assert_eq!(queue.size(), 3);

        let drained: Vec<f64> = queue.get_events().iter().map(reading).collect();
        assert_eq!(drained, vec![1.0, 2.0, 3.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut queue = EventQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.insert_event(event(1.0));
        queue.insert_event(event(2.0));
        let drained = queue.get_events();
        assert_eq!(drained.len(), 1);
        assert_eq!(reading(&drained[0]), 2.0);
    }

    #[test]
    fn test_last_event_date_survives_drain() {
        let mut queue = EventQueue::new(4);
        assert!(queue.get_last_event_date().is_none());

        let e = event(1.0);
        let date = e.reception_date;
        queue.insert_event(e);
        assert_eq!(queue.get_last_event_date(), Some(date));

        queue.get_events();
        assert_eq!(queue.get_last_event_date(), Some(date));
        assert!(queue.get_events().is_empty());
    }
}
