#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use schoolbus_watch::automation::{
    ActivationSession, CommandError, CommandOutcome, CommandParams, DesiredState, Device,
    DeviceCategory, SessionObserver,
};
use schoolbus_watch::detect::{BoundingBox, CoordinateSpace, RawDetection, COCO_BUS};

/// Shared call log: (device id, state, when).
pub type CallLog = Arc<Mutex<Vec<(String, DesiredState, Instant)>>>;

/// Device that records every command, optionally failing or stalling.
pub struct RecordingDevice {
    id: String,
    category: DeviceCategory,
    log: CallLog,
    fail_on: Option<DesiredState>,
    delay: Duration,
}

impl RecordingDevice {
    pub fn new(id: &str, category: DeviceCategory, log: &CallLog) -> Self {
        Self {
            id: id.to_string(),
            category,
            log: Arc::clone(log),
            fail_on: None,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_on(mut self, state: DesiredState) -> Self {
        self.fail_on = Some(state);
        self
    }

    pub fn stalling(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Device for RecordingDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> DeviceCategory {
        self.category
    }

    fn set_state(&self, state: DesiredState, _params: &CommandParams) -> Result<(), CommandError> {
        self.log
            .lock()
            .unwrap()
            .push((self.id.clone(), state, Instant::now()));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_on == Some(state) {
            return Err(CommandError::Unreachable(format!("{} offline", self.id)));
        }
        Ok(())
    }
}

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog, id: &str, state: DesiredState) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(device, s, _)| device == id && *s == state)
        .count()
}

pub fn order(log: &CallLog, state: DesiredState) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(_, s, _)| *s == state)
        .map(|(device, _, _)| device.clone())
        .collect()
}

/// Keeps every archived session and phase change.
#[derive(Default)]
pub struct CollectingObserver {
    pub phases: Mutex<Vec<(u64, schoolbus_watch::automation::Phase)>>,
    pub archived: Mutex<Vec<ActivationSession>>,
    pub commands: Mutex<Vec<CommandOutcome>>,
}

impl CollectingObserver {
    pub fn archived(&self) -> Vec<ActivationSession> {
        self.archived.lock().unwrap().clone()
    }

    pub fn phases(&self) -> Vec<(u64, schoolbus_watch::automation::Phase)> {
        self.phases.lock().unwrap().clone()
    }
}

impl SessionObserver for CollectingObserver {
    fn on_phase(&self, session: &ActivationSession) {
        self.phases.lock().unwrap().push((session.id, session.phase));
    }

    fn on_archived(&self, session: &ActivationSession) {
        self.archived.lock().unwrap().push(session.clone());
    }

    fn on_command(&self, outcome: &CommandOutcome) {
        self.commands.lock().unwrap().push(outcome.clone());
    }
}

/// A bus that passes the default filter: area 0.24, aspect 1.5.
pub fn bus(confidence: f32) -> RawDetection {
    RawDetection {
        class_id: COCO_BUS,
        confidence,
        bbox: BoundingBox::new(0.1, 0.3, 0.7, 0.7),
        space: CoordinateSpace::Normalized,
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
