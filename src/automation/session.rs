use std::time::{Duration, Instant};

use serde::Serialize;

use super::device::{CommandError, DesiredState};

/// Dispatcher phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Activating,
    Holding,
    Deactivating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Activating => "activating",
            Phase::Holding => "holding",
            Phase::Deactivating => "deactivating",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle)
    }
}

/// Why a session started.
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    Event {
        sequence: u64,
        class_name: String,
        confidence: f32,
    },
    Manual,
}

impl Trigger {
    pub fn confidence(&self) -> Option<f32> {
        match self {
            Trigger::Event { confidence, .. } => Some(*confidence),
            Trigger::Manual => None,
        }
    }
}

/// Result of one device command.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandOutcome {
    pub device_id: String,
    pub requested: DesiredState,
    pub result: Result<(), CommandError>,
    pub at: Instant,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// One activation, from the first "on" to the last "off".
#[derive(Clone, Debug, PartialEq)]
pub struct ActivationSession {
    pub id: u64,
    pub trigger: Trigger,
    pub started_at: Instant,
    pub hold: Duration,
    pub phase: Phase,
    /// Every phase entered, in order, starting with ACTIVATING.
    pub history: Vec<Phase>,
    /// Set once HOLDING begins; moves forward on every extension.
    pub hold_until: Option<Instant>,
    /// Events absorbed by this session after the one that started it.
    pub extensions: u32,
    pub outcomes: Vec<CommandOutcome>,
    pub ended_at: Option<Instant>,
    /// Hold ends as soon as HOLDING is reached (manual off during ACTIVATING).
    pub(crate) cut_short: bool,
}

impl ActivationSession {
    pub(crate) fn new(id: u64, trigger: Trigger, started_at: Instant, hold: Duration) -> Self {
        Self {
            id,
            trigger,
            started_at,
            hold,
            phase: Phase::Activating,
            history: vec![Phase::Activating],
            hold_until: None,
            extensions: 0,
            outcomes: Vec::new(),
            ended_at: None,
            cut_short: false,
        }
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.history.push(phase);
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded()).count()
    }

    pub fn outcomes_for(&self, requested: DesiredState) -> impl Iterator<Item = &CommandOutcome> {
        self.outcomes
            .iter()
            .filter(move |o| o.requested == requested)
    }
}
