//! Pipeline coordinator.
//!
//! One thread owns capture and detection and runs them strictly in order:
//! acquire → detect → filter → debounce → dispatch. Dispatch and telemetry
//! hand work to their own threads, so a slow device or broker never delays the
//! next frame. Capture and inference failures are counted, folded into
//! `Health`, and retried with capped exponential backoff; the loop itself
//! never gives up.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::automation::{Device, Dispatcher, Phase, SessionObserver};
use crate::config::{ConfigHandle, RuntimeSettings, TelemetrySettings};
use crate::control::{self, ControlCommand};
use crate::debounce::{Debouncer, DetectionEvent};
use crate::detect::{Detector, DetectorAdapter, InferenceError};
use crate::filter;
use crate::frame::{CaptureError, FrameSource};
use crate::telemetry::{
    Health, HealthCell, MetricsAggregator, PipelineMetrics, TelemetryPublisher, TelemetrySink,
};

/// Shared stop flag. Sleeps in the capture loop wait on it, so a stop request
/// interrupts a backoff instead of waiting it out.
#[derive(Default)]
pub struct ShutdownSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`. Returns true if shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Capped exponential backoff.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay for this failure; doubles for the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = (delay * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Processed {
        qualifying: usize,
        event: Option<DetectionEvent>,
    },
    CaptureFailed(CaptureError),
    InferenceFailed(InferenceError),
}

impl CycleOutcome {
    pub fn event(&self) -> Option<&DetectionEvent> {
        match self {
            CycleOutcome::Processed { event, .. } => event.as_ref(),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, CycleOutcome::Processed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cycles: u64,
    /// False when the dispatcher did not reach IDLE within the grace period.
    pub devices_released: bool,
    pub telemetry_dropped: u64,
}

pub struct Pipeline<S = Box<dyn FrameSource>, D = Box<dyn Detector>> {
    source: S,
    detector: DetectorAdapter<D>,
    debouncer: Debouncer,
    dispatcher: Dispatcher,
    config: ConfigHandle,
    runtime: RuntimeSettings,
    telemetry_settings: TelemetrySettings,
    telemetry: Arc<TelemetryPublisher>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCell>,
    aggregator: MetricsAggregator,
    control: Option<Receiver<ControlCommand>>,
    backoff: Backoff,
    capture_failures: u32,
    inference_failures: u32,
    cycles: u64,
    last_status: Instant,
    last_metrics: Instant,
    dropped_seen: u64,
}

impl<S: FrameSource, D: Detector> Pipeline<S, D> {
    pub fn new(
        source: S,
        detector: DetectorAdapter<D>,
        devices: Vec<Arc<dyn Device>>,
        config: ConfigHandle,
        runtime: RuntimeSettings,
        telemetry_settings: TelemetrySettings,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let metrics = Arc::new(PipelineMetrics::new());
        let health = Arc::new(HealthCell::new());
        let telemetry = Arc::new(TelemetryPublisher::new(
            sink,
            Arc::clone(&metrics),
            Arc::clone(&health),
            config.clone(),
        ));
        let observer: Arc<dyn SessionObserver> = telemetry.clone();
        let dispatcher = Dispatcher::new(
            devices,
            config.snapshot(),
            runtime.command_timeout,
            observer,
        )?;
        let now = Instant::now();
        Ok(Self {
            source,
            detector,
            debouncer: Debouncer::new(),
            dispatcher,
            config,
            backoff: Backoff::new(runtime.backoff_initial, runtime.backoff_max),
            aggregator: MetricsAggregator::new(telemetry_settings.latency_window, now),
            runtime,
            telemetry_settings,
            telemetry,
            metrics,
            health,
            control: None,
            capture_failures: 0,
            inference_failures: 0,
            cycles: 0,
            last_status: now,
            last_metrics: now,
            dropped_seen: 0,
        })
    }

    /// Attach the inbound control channel.
    pub fn with_control(mut self, rx: Receiver<ControlCommand>) -> Self {
        self.control = Some(rx);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn telemetry(&self) -> &Arc<TelemetryPublisher> {
        &self.telemetry
    }

    pub fn health(&self) -> Health {
        self.health.get()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Open the source and warm the detector. Failures are logged, not fatal:
    /// the capture loop keeps retrying.
    pub fn start(&mut self) {
        if let Err(err) = self.source.connect() {
            log::warn!("frame source {} not ready: {:#}", self.source.name(), err);
        }
        if let Err(err) = self.detector.warm_up() {
            log::warn!("{} warm-up failed: {:#}", self.detector.backend_name(), err);
        }
        log::info!(
            "pipeline running: source={} backend={}",
            self.source.name(),
            self.detector.backend_name()
        );
        self.telemetry.status();
    }

    /// One acquire → detect → filter → debounce → dispatch pass.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.cycles += 1;
        // One snapshot per cycle; a reload only lands on the next one.
        let config = self.config.snapshot();

        let frame = match self.source.next_frame(self.runtime.frame_timeout) {
            Ok(frame) => frame,
            Err(err) => {
                self.capture_failures = self.capture_failures.saturating_add(1);
                self.metrics.capture_failure();
                log::warn!(
                    "capture from {} failed ({} in a row): {}",
                    self.source.name(),
                    self.capture_failures,
                    err
                );
                if matches!(err, CaptureError::Disconnected(_)) {
                    if let Err(reconnect) = self.source.reconnect() {
                        log::warn!("reconnect {} failed: {:#}", self.source.name(), reconnect);
                    }
                }
                self.update_health();
                return CycleOutcome::CaptureFailed(err);
            }
        };
        self.capture_failures = 0;

        let inference = match self.detector.detect(&frame, self.runtime.inference_timeout) {
            Ok(inference) => inference,
            Err(err) => {
                self.inference_failures = self.inference_failures.saturating_add(1);
                self.metrics.inference_failure();
                log::warn!(
                    "inference on frame {} failed ({} in a row): {}",
                    frame.sequence,
                    self.inference_failures,
                    err
                );
                self.update_health();
                return CycleOutcome::InferenceFailed(err);
            }
        };
        self.inference_failures = 0;
        self.update_health();

        self.metrics.frame_processed();
        self.aggregator.record_latency(inference.latency);
        let raw_count = inference.raw_count;
        let malformed = inference.malformed;
        let outcome = filter::filter(inference.detections, &config);
        self.metrics
            .detections(raw_count, outcome.qualifying.len(), malformed);
        self.metrics.rejections(&outcome.rejected);

        let event = self
            .debouncer
            .observe(outcome.best(), frame.captured_at, config.cooldown);
        if let Some(event) = &event {
            self.metrics.event();
            log::info!(
                "bus detected: event #{} {} conf={:.2}",
                event.sequence,
                event.trigger.class_name(),
                event.trigger.confidence()
            );
            self.telemetry.detection(event);
            if let Some(effect) = self.dispatcher.dispatch(event, &config) {
                log::debug!("event #{} -> {:?}", event.sequence, effect);
            }
        }

        CycleOutcome::Processed {
            qualifying: outcome.qualifying.len(),
            event,
        }
    }

    /// Apply queued control commands. Runs between cycles only.
    pub fn poll_control(&mut self) -> usize {
        let commands = match &self.control {
            Some(rx) => control::drain(rx),
            None => return 0,
        };
        for command in &commands {
            self.apply(*command);
        }
        commands.len()
    }

    pub fn apply(&mut self, command: ControlCommand) {
        log::info!("control: {:?}", command);
        match command {
            ControlCommand::Activate => {
                let config = self.config.snapshot();
                if self.dispatcher.manual_activate(&config).is_none() {
                    log::warn!("manual activate ignored: dispatcher stopping");
                }
            }
            ControlCommand::Deactivate => {
                if !self.dispatcher.manual_deactivate() {
                    log::info!("manual deactivate ignored: nothing active");
                }
            }
            ControlCommand::ReloadConfig => {
                match self.config.reload() {
                    Ok(config) => log::info!("config reloaded (version {})", config.version),
                    Err(err) => log::warn!("{:#}", err),
                }
                self.telemetry.status();
            }
        }
    }

    /// Periodic status and metrics.
    pub fn publish_due(&mut self, now: Instant) {
        let metrics_every = self.telemetry_settings.metrics_interval;
        let status_every = self.telemetry_settings.status_interval;
        if now.saturating_duration_since(self.last_metrics) >= metrics_every {
            self.last_metrics = now;
            self.dropped_seen = self.telemetry.sync_dropped(self.dropped_seen);
            let snapshot = self.aggregator.snapshot(now, &self.metrics);
            for alert in MetricsAggregator::alerts(&snapshot, &self.telemetry_settings) {
                log::warn!("performance: {}", alert);
            }
            self.telemetry.publish_metrics(snapshot);
        }
        if now.saturating_duration_since(self.last_status) >= status_every {
            self.last_status = now;
            self.telemetry.status();
        }
    }

    fn update_health(&mut self) {
        let worst = self.capture_failures.max(self.inference_failures);
        let health = Health::from_failures(worst, self.runtime.failure_ceiling);
        let previous = self.health.set(health);
        if previous == health {
            return;
        }
        match health {
            Health::Healthy => log::info!("pipeline recovered"),
            Health::Degraded => log::warn!("pipeline degraded"),
            Health::Fatal => log::error!(
                "pipeline fatal after {} consecutive failures, still retrying",
                worst
            ),
        }
        self.telemetry.status();
    }

    /// Run until `shutdown` fires, then release devices and flush telemetry.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> ShutdownReport {
        self.start();
        while !shutdown.is_triggered() {
            self.poll_control();
            let outcome = self.run_cycle();
            self.publish_due(Instant::now());
            let pause = if outcome.is_failure() {
                self.backoff.next_delay()
            } else {
                self.backoff.reset();
                self.runtime.cycle_pause
            };
            if !pause.is_zero() && shutdown.wait(pause) {
                break;
            }
        }
        self.shutdown()
    }

    /// Stop capture, let any active session switch devices off (bounded by
    /// `shutdown_grace`), then flush a final status.
    pub fn shutdown(self) -> ShutdownReport {
        log::info!("pipeline stopping after {} cycles", self.cycles);
        let Pipeline {
            source,
            dispatcher,
            telemetry,
            runtime,
            cycles,
            dropped_seen,
            ..
        } = self;
        drop(source);

        let phase = dispatcher.phase();
        if phase != Phase::Idle {
            log::info!("waiting for session in {} to finish", phase.as_str());
        }
        let devices_released = dispatcher.shutdown(runtime.shutdown_grace);
        drop(dispatcher);

        let telemetry_dropped = telemetry.sync_dropped(dropped_seen);
        telemetry.close();
        ShutdownReport {
            cycles,
            devices_released,
            telemetry_dropped,
        }
    }
}
