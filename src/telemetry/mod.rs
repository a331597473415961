//! Telemetry: detections, status, metrics and session summaries.

mod discovery;
mod messages;
mod metrics;
mod publisher;
mod sink;

pub use discovery::{publish_discovery, sanitize_for_id};
pub use messages::{
    unix_now, DetectionMessage, MetricsMessage, OutcomeRecord, SessionMessage, StatusMessage,
    TelemetryMessage, SCHEMA_VERSION,
};
pub use metrics::{
    Health, HealthCell, MetricsAggregator, MetricsCounters, MetricsSnapshot, PerformanceAlert,
    PipelineMetrics,
};
pub use publisher::TelemetryPublisher;
pub use sink::{LogSink, MemorySink, MqttSink, TelemetrySink};
