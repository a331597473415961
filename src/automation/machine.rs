//! Activation state machine, free of threads and clocks.
//!
//! Every method takes the current `Instant` explicitly; the threaded
//! dispatcher drives it, and tests drive it with synthetic timestamps.

use std::time::{Duration, Instant};

use super::session::{ActivationSession, CommandOutcome, Phase, Trigger};
use crate::config::MAX_DURATION;

/// `at + span`, capped at `MAX_DURATION` and saturating at `at` when even the
/// cap does not fit in an `Instant`.
pub fn deadline_after(at: Instant, span: Duration) -> Instant {
    at.checked_add(span.min(MAX_DURATION))
        .or_else(|| at.checked_add(MAX_DURATION))
        .unwrap_or(at)
}

/// What the caller has to do after `on_event`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventEffect {
    /// New session in ACTIVATING: issue "on" commands.
    Started { session_id: u64 },
    /// HOLDING deadline moved to `event + hold`.
    Extended { session_id: u64 },
    /// Arrived during ACTIVATING; the hold will start full anyway.
    Refreshed { session_id: u64 },
    /// Arrived during DEACTIVATING; a new session starts once IDLE.
    Queued,
}

#[derive(Default)]
pub struct ActivationMachine {
    session: Option<ActivationSession>,
    queued: Option<(Trigger, Instant, Duration)>,
    next_id: u64,
    sessions_started: u64,
}

impl ActivationMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.session
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(Phase::Idle)
    }

    pub fn session(&self) -> Option<&ActivationSession> {
        self.session.as_ref()
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started
    }

    pub fn has_queued(&self) -> bool {
        self.queued.is_some()
    }

    pub fn drop_queued(&mut self) {
        self.queued = None;
    }

    pub fn on_event(&mut self, trigger: Trigger, at: Instant, hold: Duration) -> EventEffect {
        let Some(session) = self.session.as_mut() else {
            self.next_id += 1;
            self.sessions_started += 1;
            let id = self.next_id;
            self.session = Some(ActivationSession::new(id, trigger, at, hold));
            return EventEffect::Started { session_id: id };
        };
        match session.phase {
            Phase::Activating => {
                session.extensions += 1;
                session.hold = hold;
                EventEffect::Refreshed {
                    session_id: session.id,
                }
            }
            Phase::Holding => {
                session.extensions += 1;
                session.hold = hold;
                session.hold_until = Some(deadline_after(at, hold));
                EventEffect::Extended {
                    session_id: session.id,
                }
            }
            Phase::Deactivating | Phase::Idle => {
                self.queued = Some((trigger, at, hold));
                EventEffect::Queued
            }
        }
    }

    /// All "on" commands are out: ACTIVATING -> HOLDING.
    pub fn on_activation_issued(&mut self, now: Instant) -> bool {
        match self.session.as_mut() {
            Some(session) if session.phase == Phase::Activating => {
                session.enter(Phase::Holding);
                session.hold_until = Some(if session.cut_short {
                    now
                } else {
                    deadline_after(now, session.hold)
                });
                true
            }
            _ => false,
        }
    }

    /// Deadline of the current hold, if HOLDING.
    pub fn hold_deadline(&self) -> Option<Instant> {
        self.session
            .as_ref()
            .filter(|s| s.phase == Phase::Holding)
            .and_then(|s| s.hold_until)
    }

    /// HOLDING -> DEACTIVATING once the hold has run out.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.hold_deadline() {
            Some(deadline) if now >= deadline => {
                if let Some(session) = self.session.as_mut() {
                    session.enter(Phase::Deactivating);
                }
                true
            }
            _ => false,
        }
    }

    /// End the hold early. Returns false when there is nothing to end.
    pub fn end_hold(&mut self, now: Instant) -> bool {
        self.queued = None;
        match self.session.as_mut() {
            Some(session) if session.phase == Phase::Holding => {
                session.hold_until = Some(now);
                true
            }
            Some(session) if session.phase == Phase::Activating => {
                session.cut_short = true;
                true
            }
            _ => false,
        }
    }

    /// Attach a command result to the current session. Results for a session
    /// that is already archived are refused.
    pub fn record(&mut self, session_id: u64, outcome: CommandOutcome) -> bool {
        match self.session.as_mut() {
            Some(session) if session.id == session_id => {
                session.outcomes.push(outcome);
                true
            }
            _ => false,
        }
    }

    /// DEACTIVATING -> IDLE. Returns the archived session; if an event was
    /// queued meanwhile, a fresh session has already been started from it.
    pub fn on_deactivation_complete(
        &mut self,
        now: Instant,
    ) -> Option<(ActivationSession, Option<EventEffect>)> {
        if self.phase() != Phase::Deactivating {
            return None;
        }
        let mut archived = self.session.take()?;
        archived.enter(Phase::Idle);
        archived.ended_at = Some(now);
        let restarted = self
            .queued
            .take()
            .map(|(trigger, at, hold)| self.on_event(trigger, at, hold));
        Some((archived, restarted))
    }
}
