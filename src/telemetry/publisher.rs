//! Builds telemetry messages from pipeline and dispatcher state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::automation::{ActivationSession, CommandOutcome, Phase, SessionObserver};
use crate::config::ConfigHandle;
use crate::debounce::DetectionEvent;

use super::messages::{
    unix_now, DetectionMessage, MetricsMessage, SessionMessage, StatusMessage, TelemetryMessage,
    SCHEMA_VERSION,
};
use super::metrics::{HealthCell, MetricsSnapshot, PipelineMetrics};
use super::sink::TelemetrySink;

#[derive(Default)]
struct StatusState {
    last_event: Option<(u64, Instant)>,
    phase: Option<Phase>,
    session_id: Option<u64>,
    last_metrics: Option<MetricsSnapshot>,
}

pub struct TelemetryPublisher {
    sink: Arc<dyn TelemetrySink>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCell>,
    config: ConfigHandle,
    started_at: Instant,
    state: Mutex<StatusState>,
}

impl TelemetryPublisher {
    pub fn new(
        sink: Arc<dyn TelemetrySink>,
        metrics: Arc<PipelineMetrics>,
        health: Arc<HealthCell>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            sink,
            metrics,
            health,
            config,
            started_at: Instant::now(),
            state: Mutex::new(StatusState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StatusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Detection message followed by a refreshed status.
    pub fn detection(&self, event: &DetectionEvent) {
        self.state().last_event = Some((event.sequence, event.timestamp));
        self.sink
            .publish(TelemetryMessage::Detection(DetectionMessage::from_event(event)));
        self.status();
    }

    pub fn status(&self) {
        let message = self.build_status(Instant::now());
        self.sink.publish(TelemetryMessage::Status(message));
    }

    pub fn build_status(&self, now: Instant) -> StatusMessage {
        let state = self.state();
        StatusMessage {
            schema_version: SCHEMA_VERSION,
            health: self.health.get(),
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs_f64(),
            last_event_sequence: state.last_event.map(|(seq, _)| seq),
            last_event_age_secs: state
                .last_event
                .map(|(_, at)| now.saturating_duration_since(at).as_secs_f64()),
            session_phase: state.phase.unwrap_or(Phase::Idle),
            session_id: state.session_id,
            config_version: self.config.snapshot().version,
            config_error: self.config.last_error(),
            metrics: state.last_metrics.clone(),
            timestamp: unix_now(),
        }
    }

    pub fn publish_metrics(&self, snapshot: MetricsSnapshot) {
        self.state().last_metrics = Some(snapshot.clone());
        self.sink.publish(TelemetryMessage::Metrics(MetricsMessage {
            schema_version: SCHEMA_VERSION,
            snapshot,
            timestamp: unix_now(),
        }));
    }

    /// Copy the sink's drop count into the shared counters.
    pub fn sync_dropped(&self, already_counted: u64) -> u64 {
        let dropped = self.sink.dropped();
        if dropped > already_counted {
            self.metrics.telemetry_dropped(dropped - already_counted);
        }
        dropped.max(already_counted)
    }

    /// Final status, then drain the sink.
    pub fn close(&self) {
        self.status();
        self.sink.close();
    }
}

impl SessionObserver for TelemetryPublisher {
    fn on_phase(&self, session: &ActivationSession) {
        {
            let mut state = self.state();
            state.phase = Some(session.phase);
            state.session_id = Some(session.id);
        }
        log::info!("session {} -> {}", session.id, session.phase.as_str());
        self.status();
    }

    fn on_archived(&self, session: &ActivationSession) {
        {
            let mut state = self.state();
            state.phase = Some(Phase::Idle);
            state.session_id = None;
        }
        self.sink
            .publish(TelemetryMessage::Session(SessionMessage::from_session(session)));
        self.status();
    }

    fn on_command(&self, outcome: &CommandOutcome) {
        self.metrics.command(outcome.succeeded());
        if let Err(err) = &outcome.result {
            log::warn!(
                "device {} {} failed: {}",
                outcome.device_id,
                outcome.requested.as_str(),
                err
            );
        }
    }
}
