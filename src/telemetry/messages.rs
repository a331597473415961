//! Outbound telemetry payloads. Every payload carries `schema_version` and a
//! unix-seconds `timestamp`; internal `Instant`s are converted to offsets.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;

use crate::automation::{ActivationSession, Phase, Trigger};
use crate::debounce::DetectionEvent;
use crate::transport::Topics;

use super::metrics::{Health, MetricsSnapshot};

pub const SCHEMA_VERSION: u32 = 1;

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone, Debug, Serialize)]
pub struct DetectionMessage {
    pub schema_version: u32,
    pub sequence: u64,
    pub detected: bool,
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`, normalized.
    pub bbox: [f32; 4],
    pub center: [f32; 2],
    pub area: f32,
    pub timestamp: f64,
}

impl DetectionMessage {
    pub fn from_event(event: &DetectionEvent) -> Self {
        let det = &event.trigger;
        let b = det.bbox();
        let (cx, cy) = det.center();
        Self {
            schema_version: SCHEMA_VERSION,
            sequence: event.sequence,
            detected: true,
            class_name: det.class_name().to_string(),
            confidence: det.confidence(),
            bbox: [b.x1, b.y1, b.x2, b.y2],
            center: [cx, cy],
            area: det.area(),
            timestamp: unix_now(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusMessage {
    pub schema_version: u32,
    pub health: Health,
    pub uptime_secs: f64,
    pub last_event_sequence: Option<u64>,
    pub last_event_age_secs: Option<f64>,
    pub session_phase: Phase,
    pub session_id: Option<u64>,
    pub config_version: u64,
    pub config_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    pub timestamp: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsMessage {
    pub schema_version: u32,
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    pub timestamp: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct OutcomeRecord {
    pub device_id: String,
    pub requested: &'static str,
    pub success: bool,
    pub error: Option<String>,
    /// Milliseconds after the session started.
    pub offset_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionMessage {
    pub schema_version: u32,
    pub session_id: u64,
    /// `"event"` or `"manual"`.
    pub trigger: &'static str,
    pub event_sequence: Option<u64>,
    pub confidence: Option<f32>,
    pub hold_secs: f64,
    pub extensions: u32,
    /// Phases the session went through, e.g. `["activating", "holding", ...]`.
    pub phases: Vec<&'static str>,
    pub duration_secs: f64,
    pub outcomes: Vec<OutcomeRecord>,
    pub failures: usize,
    pub timestamp: f64,
}

impl SessionMessage {
    pub fn from_session(session: &ActivationSession) -> Self {
        let (trigger, event_sequence) = match &session.trigger {
            Trigger::Event { sequence, .. } => ("event", Some(*sequence)),
            Trigger::Manual => ("manual", None),
        };
        let ended = session.ended_at.unwrap_or(session.started_at);
        let outcomes = session
            .outcomes
            .iter()
            .map(|o| OutcomeRecord {
                device_id: o.device_id.clone(),
                requested: o.requested.as_str(),
                success: o.succeeded(),
                error: o.result.as_ref().err().map(|e| e.to_string()),
                offset_ms: o.at.saturating_duration_since(session.started_at).as_millis() as u64,
            })
            .collect();
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: session.id,
            trigger,
            event_sequence,
            confidence: session.trigger.confidence(),
            hold_secs: session.hold.as_secs_f64(),
            extensions: session.extensions,
            phases: session.history.iter().map(|p| p.as_str()).collect(),
            duration_secs: ended.saturating_duration_since(session.started_at).as_secs_f64(),
            outcomes,
            failures: session.failures(),
            timestamp: unix_now(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum TelemetryMessage {
    Detection(DetectionMessage),
    Status(StatusMessage),
    Metrics(MetricsMessage),
    Session(SessionMessage),
}

impl TelemetryMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryMessage::Detection(_) => "detection",
            TelemetryMessage::Status(_) => "status",
            TelemetryMessage::Metrics(_) => "metrics",
            TelemetryMessage::Session(_) => "session",
        }
    }

    pub fn topic(&self, topics: &Topics) -> String {
        match self {
            TelemetryMessage::Detection(_) => topics.detection(),
            TelemetryMessage::Status(_) => topics.status(),
            TelemetryMessage::Metrics(_) => topics.metrics(),
            TelemetryMessage::Session(_) => topics.session(),
        }
    }

    /// Status is retained so a fresh subscriber sees the latest state.
    pub fn retain(&self) -> bool {
        matches!(self, TelemetryMessage::Status(_))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            TelemetryMessage::Detection(m) => serde_json::to_vec(m)?,
            TelemetryMessage::Status(m) => serde_json::to_vec(m)?,
            TelemetryMessage::Metrics(m) => serde_json::to_vec(m)?,
            TelemetryMessage::Session(m) => serde_json::to_vec(m)?,
        };
        Ok(bytes)
    }
}
