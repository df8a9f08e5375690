//! Metric data points and sinks
//!
//! The transport and the registry report counters through a [`MetricsSink`].
//! Each data point carries the adapter/device dimensions it was tagged with
//! at construction time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

// ============================================================================
// Metric names
// ============================================================================

pub const METRICS_CONNECTIONS: &str = "Connections";
pub const METRICS_CONNECTION_ERRORS: &str = "ConnectionErrors";
pub const METRICS_BYTES_SENT: &str = "BytesSent";
pub const METRICS_BYTES_RECEIVED: &str = "BytesReceived";
pub const METRICS_READS: &str = "Reads";
pub const METRICS_READ_DURATION: &str = "ReadDuration";
pub const METRICS_READ_ERRORS: &str = "ReadErrors";

// ============================================================================
// Dimension keys
// ============================================================================

pub const DIMENSION_ADAPTER: &str = "Adapter";
pub const DIMENSION_DEVICE: &str = "Device";
pub const DIMENSION_SOURCE: &str = "Source";

/// Unit of a metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricUnit {
    Count,
    Bytes,
    Milliseconds,
}

/// Ordered key/value tags attached to every data point
pub type MetricDimensions = BTreeMap<String, String>;

/// Build dimensions for an adapter/device pair
pub fn device_dimensions(adapter: &str, device: &str) -> MetricDimensions {
    let mut dims = MetricDimensions::new();
    dims.insert(DIMENSION_ADAPTER.to_string(), adapter.to_string());
    dims.insert(DIMENSION_DEVICE.to_string(), device.to_string());
    dims
}

/// A single measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsDataPoint {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub dimensions: MetricDimensions,
    pub timestamp: DateTime<Utc>,
}

impl MetricsDataPoint {
    pub fn new(name: &str, value: f64, unit: MetricUnit, dimensions: &MetricDimensions) -> Self {
        Self {
            name: name.to_string(),
            value,
            unit,
            dimensions: dimensions.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of metric data points
///
/// `put` is called from transport and registry tasks; implementations must
/// not block.
pub trait MetricsSink: Send + Sync {
    fn put(&self, source: &str, point: MetricsDataPoint);
}

/// Sink that keeps every data point in memory
#[derive(Debug, Default)]
pub struct MetricsBuffer {
    points: Mutex<Vec<(String, MetricsDataPoint)>>,
}

impl MetricsBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Remove and return everything collected so far
    pub fn drain(&self) -> Vec<(String, MetricsDataPoint)> {
        std::mem::take(&mut *self.points.lock())
    }

    /// Sum of all values recorded under `name`
    pub fn total(&self, name: &str) -> f64 {
        self.points
            .lock()
            .iter()
            .filter(|(_, p)| p.name == name)
            .map(|(_, p)| p.value)
            .sum()
    }

    /// Number of data points recorded under `name`
    pub fn count(&self, name: &str) -> usize {
        self.points
            .lock()
            .iter()
            .filter(|(_, p)| p.name == name)
            .count()
    }
}

impl MetricsSink for MetricsBuffer {
    fn put(&self, source: &str, point: MetricsDataPoint) {
        self.points.lock().push((source.to_string(), point));
    }
}

/// Tags and forwards data points for one component
#[derive(Clone)]
pub(crate) struct MetricsEmitter {
    source: String,
    dimensions: MetricDimensions,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl MetricsEmitter {
    pub(crate) fn new(
        source: impl Into<String>,
        dimensions: MetricDimensions,
        sink: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        Self {
            source: source.into(),
            dimensions,
            sink,
        }
    }

    pub(crate) fn emit(&self, name: &str, value: f64, unit: MetricUnit) {
        if let Some(sink) = &self.sink {
            sink.put(
                &self.source,
                MetricsDataPoint::new(name, value, unit, &self.dimensions),
            );
        }
    }

    pub(crate) fn count(&self, name: &str) {
        self.emit(name, 1.0, MetricUnit::Count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_totals() {
        let buffer = MetricsBuffer::new();
        let dims = device_dimensions("adapter-1", "plc-1");
        buffer.put(
            "adapter-1",
            MetricsDataPoint::new(METRICS_BYTES_SENT, 12.0, MetricUnit::Bytes, &dims),
        );
        buffer.put(
            "adapter-1",
            MetricsDataPoint::new(METRICS_BYTES_SENT, 8.0, MetricUnit::Bytes, &dims),
        );

        assert_eq!(buffer.total(METRICS_BYTES_SENT), 20.0);
        assert_eq!(buffer.count(METRICS_BYTES_SENT), 2);
        assert_eq!(buffer.count(METRICS_CONNECTIONS), 0);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1.dimensions[DIMENSION_DEVICE], "plc-1");
        assert_eq!(buffer.count(METRICS_BYTES_SENT), 0);
    }

    #[test]
    fn test_emitter_without_sink_is_silent() {
        let emitter = MetricsEmitter::new("a", MetricDimensions::new(), None);
        emitter.count(METRICS_CONNECTIONS);
    }

    #[test]
    fn test_emitter_tags_source_and_dimensions() {
        let buffer = MetricsBuffer::new();
        let emitter = MetricsEmitter::new(
            "adapter-1",
            device_dimensions("adapter-1", "plc-1"),
            Some(buffer.clone()),
        );
        emitter.count(METRICS_CONNECTION_ERRORS);

        let points = buffer.drain();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].0, "adapter-1");
        assert_eq!(points[0].1.unit, MetricUnit::Count);
        assert_eq!(points[0].1.dimensions[DIMENSION_ADAPTER], "adapter-1");
    }
}
