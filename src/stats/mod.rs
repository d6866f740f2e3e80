//! Event system statistics

pub mod metrics;

pub use metrics::{ConsumerMetrics, ConsumerStats, SupplierMetrics, SupplierStats};
