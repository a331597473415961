//! Pipeline counters, rolling performance figures and health.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::TelemetrySettings;
use crate::filter::RejectionCounts;

/// Shared atomic counters. Any thread may bump them.
#[derive(Default)]
pub struct PipelineMetrics {
    frames_processed: AtomicU64,
    raw_detections: AtomicU64,
    qualifying_detections: AtomicU64,
    rejected_class: AtomicU64,
    rejected_confidence: AtomicU64,
    rejected_zone: AtomicU64,
    rejected_size: AtomicU64,
    rejected_capped: AtomicU64,
    malformed: AtomicU64,
    events: AtomicU64,
    capture_failures: AtomicU64,
    inference_failures: AtomicU64,
    commands_ok: AtomicU64,
    commands_failed: AtomicU64,
    telemetry_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_processed(&self) {
        bump(&self.frames_processed, 1);
    }

    pub fn detections(&self, raw: usize, qualifying: usize, malformed: u64) {
        bump(&self.raw_detections, raw as u64);
        bump(&self.qualifying_detections, qualifying as u64);
        bump(&self.malformed, malformed);
    }

    pub fn rejections(&self, counts: &RejectionCounts) {
        bump(&self.rejected_class, counts.class);
        bump(&self.rejected_confidence, counts.confidence);
        bump(&self.rejected_zone, counts.zone);
        bump(&self.rejected_size, counts.size);
        bump(&self.rejected_capped, counts.capped);
    }

    pub fn event(&self) {
        bump(&self.events, 1);
    }

    pub fn capture_failure(&self) {
        bump(&self.capture_failures, 1);
    }

    pub fn inference_failure(&self) {
        bump(&self.inference_failures, 1);
    }

    pub fn command(&self, ok: bool) {
        if ok {
            bump(&self.commands_ok, 1);
        } else {
            bump(&self.commands_failed, 1);
        }
    }

    pub fn telemetry_dropped(&self, by: u64) {
        bump(&self.telemetry_dropped, by);
    }

    pub fn counters(&self) -> MetricsCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsCounters {
            frames_processed: get(&self.frames_processed),
            raw_detections: get(&self.raw_detections),
            qualifying_detections: get(&self.qualifying_detections),
            rejected_class: get(&self.rejected_class),
            rejected_confidence: get(&self.rejected_confidence),
            rejected_zone: get(&self.rejected_zone),
            rejected_size: get(&self.rejected_size),
            rejected_capped: get(&self.rejected_capped),
            malformed: get(&self.malformed),
            events: get(&self.events),
            capture_failures: get(&self.capture_failures),
            inference_failures: get(&self.inference_failures),
            commands_ok: get(&self.commands_ok),
            commands_failed: get(&self.commands_failed),
            telemetry_dropped: get(&self.telemetry_dropped),
        }
    }
}

/// Plain copy of `PipelineMetrics`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsCounters {
    pub frames_processed: u64,
    pub raw_detections: u64,
    pub qualifying_detections: u64,
    pub rejected_class: u64,
    pub rejected_confidence: u64,
    pub rejected_zone: u64,
    pub rejected_size: u64,
    pub rejected_capped: u64,
    pub malformed: u64,
    pub events: u64,
    pub capture_failures: u64,
    pub inference_failures: u64,
    pub commands_ok: u64,
    pub commands_failed: u64,
    pub telemetry_dropped: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub avg_inference_ms: f64,
    pub max_inference_ms: f64,
    pub min_inference_ms: f64,
    /// Over the interval since the previous snapshot.
    pub current_fps: f64,
    /// Since start.
    pub average_fps: f64,
    /// Qualifying detections per processed frame.
    pub detection_rate: f64,
    #[serde(flatten)]
    pub counters: MetricsCounters,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PerformanceAlert {
    SlowInference { avg_ms: f64, limit_ms: f64 },
    LowFrameRate { fps: f64, min_fps: f64 },
}

impl std::fmt::Display for PerformanceAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerformanceAlert::SlowInference { avg_ms, limit_ms } => {
                write!(f, "average inference {:.1}ms exceeds {:.1}ms", avg_ms, limit_ms)
            }
            PerformanceAlert::LowFrameRate { fps, min_fps } => {
                write!(f, "frame rate {:.1} fps below {:.1} fps", fps, min_fps)
            }
        }
    }
}

/// Single-reader side of the metrics: rolling latency window and fps math.
/// Owned by the coordinator.
pub struct MetricsAggregator {
    latencies_ms: VecDeque<f64>,
    window: usize,
    started_at: Instant,
    last_snapshot: Option<(Instant, u64)>,
}

impl MetricsAggregator {
    pub fn new(window: usize, started_at: Instant) -> Self {
        Self {
            latencies_ms: VecDeque::with_capacity(window.min(4096)),
            window: window.max(1),
            started_at,
            last_snapshot: None,
        }
    }

    pub fn record_latency(&mut self, latency: Duration) {
        if self.latencies_ms.len() == self.window {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&mut self, now: Instant, metrics: &PipelineMetrics) -> MetricsSnapshot {
        let counters = metrics.counters();
        let uptime = now.saturating_duration_since(self.started_at).as_secs_f64();
        let (since, frames_before) = self.last_snapshot.unwrap_or((self.started_at, 0));
        let interval = now.saturating_duration_since(since).as_secs_f64();
        let frames = counters.frames_processed;
        self.last_snapshot = Some((now, frames));

        let (avg, max, min) = if self.latencies_ms.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = self.latencies_ms.iter().sum();
            let max = self.latencies_ms.iter().copied().fold(f64::MIN, f64::max);
            let min = self.latencies_ms.iter().copied().fold(f64::MAX, f64::min);
            (sum / self.latencies_ms.len() as f64, max, min)
        };
        let rate = |count: u64, secs: f64| if secs > 0.0 { count as f64 / secs } else { 0.0 };

        MetricsSnapshot {
            uptime_secs: uptime,
            avg_inference_ms: avg,
            max_inference_ms: max,
            min_inference_ms: min,
            current_fps: rate(frames.saturating_sub(frames_before), interval),
            average_fps: rate(frames, uptime),
            detection_rate: if frames > 0 {
                counters.qualifying_detections as f64 / frames as f64
            } else {
                0.0
            },
            counters,
        }
    }

    /// Threshold checks run on each metrics interval.
    pub fn alerts(
        snapshot: &MetricsSnapshot,
        settings: &TelemetrySettings,
    ) -> Vec<PerformanceAlert> {
        let mut alerts = Vec::new();
        if snapshot.avg_inference_ms > settings.max_inference_ms {
            alerts.push(PerformanceAlert::SlowInference {
                avg_ms: snapshot.avg_inference_ms,
                limit_ms: settings.max_inference_ms,
            });
        }
        if snapshot.counters.frames_processed > 0 && snapshot.current_fps < settings.min_fps {
            alerts.push(PerformanceAlert::LowFrameRate {
                fps: snapshot.current_fps,
                min_fps: settings.min_fps,
            });
        }
        alerts
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Fatal,
}

impl Health {
    /// 0 failures: healthy; below the ceiling: degraded; at or above it: fatal.
    pub fn from_failures(consecutive: u32, ceiling: u32) -> Self {
        if consecutive == 0 {
            Health::Healthy
        } else if consecutive < ceiling {
            Health::Degraded
        } else {
            Health::Fatal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Fatal => "fatal",
        }
    }
}

/// Health shared between the coordinator (writer) and telemetry (readers).
pub struct HealthCell(AtomicU8);

impl HealthCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Health::Healthy as u8))
    }

    pub fn get(&self) -> Health {
        match self.0.load(Ordering::Acquire) {
            0 => Health::Healthy,
            1 => Health::Degraded,
            _ => Health::Fatal,
        }
    }

    /// Store `health`, returning the previous value.
    pub fn set(&self, health: Health) -> Health {
        match self.0.swap(health as u8, Ordering::AcqRel) {
            0 => Health::Healthy,
            1 => Health::Degraded,
            _ => Health::Fatal,
        }
    }
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_thresholds() {
        assert_eq!(Health::from_failures(0, 5), Health::Healthy);
        assert_eq!(Health::from_failures(4, 5), Health::Degraded);
        assert_eq!(Health::from_failures(5, 5), Health::Fatal);
        let cell = HealthCell::new();
        assert_eq!(cell.set(Health::Fatal), Health::Healthy);
        assert_eq!(cell.get(), Health::Fatal);
    }

    #[test]
    fn latency_window_rolls() {
        let t0 = Instant::now();
        let metrics = PipelineMetrics::new();
        let mut agg = MetricsAggregator::new(3, t0);
        for ms in [100, 10, 20, 30] {
            agg.record_latency(Duration::from_millis(ms));
        }
        let snap = agg.snapshot(t0 + Duration::from_secs(1), &metrics);
        assert!((snap.avg_inference_ms - 20.0).abs() < 1e-9);
        assert!((snap.max_inference_ms - 30.0).abs() < 1e-9);
        assert!((snap.min_inference_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn fps_over_interval_and_since_start() {
        let t0 = Instant::now();
        let metrics = PipelineMetrics::new();
        let mut agg = MetricsAggregator::new(10, t0);
        for _ in 0..20 {
            metrics.frame_processed();
        }
        let first = agg.snapshot(t0 + Duration::from_secs(2), &metrics);
        assert!((first.current_fps - 10.0).abs() < 1e-9);
        for _ in 0..4 {
            metrics.frame_processed();
        }
        let second = agg.snapshot(t0 + Duration::from_secs(4), &metrics);
        assert!((second.current_fps - 2.0).abs() < 1e-9);
        assert!((second.average_fps - 6.0).abs() < 1e-9);
    }

    #[test]
    fn alerts_fire_on_thresholds() {
        let settings = TelemetrySettings::default();
        let snapshot = MetricsSnapshot {
            avg_inference_ms: 150.0,
            current_fps: 4.0,
            counters: MetricsCounters {
                frames_processed: 40,
                ..MetricsCounters::default()
            },
            ..MetricsSnapshot::default()
        };
        let alerts = MetricsAggregator::alerts(&snapshot, &settings);
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].to_string().contains("150.0ms"));
    }
}
