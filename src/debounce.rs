//! Event debouncer.
//!
//! A bus stays in view for many frames; the debouncer turns that stream into
//! at most one `DetectionEvent` per cooldown window. The window is measured
//! from the last emitted event, not the last sighting, so a parked bus still
//! yields one event per window.

use std::time::{Duration, Instant};

use crate::detect::Detection;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Cooldown,
}

/// A debounced "bus arrived" occurrence.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionEvent {
    /// Starts at 1, strictly increasing.
    pub sequence: u64,
    pub timestamp: Instant,
    pub trigger: Detection,
}

pub struct Debouncer {
    state: DebounceState,
    last_event_at: Option<Instant>,
    next_sequence: u64,
    suppressed: u64,
}

impl Debouncer {
    pub fn new() -> Self {
        Self {
            state: DebounceState::Idle,
            last_event_at: None,
            next_sequence: 1,
            suppressed: 0,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn last_event_at(&self) -> Option<Instant> {
        self.last_event_at
    }

    /// Cycles with a qualifying detection that were swallowed by the cooldown.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Feed one cycle.
    ///
    /// `best` is the top-ranked qualifying detection of the cycle (if any) and
    /// `now` the cycle's frame timestamp. The cooldown is passed per call so a
    /// reloaded config takes effect on the next cycle.
    pub fn observe(
        &mut self,
        best: Option<&Detection>,
        now: Instant,
        cooldown: Duration,
    ) -> Option<DetectionEvent> {
        let detection = best?;
        if let (DebounceState::Cooldown, Some(last)) = (self.state, self.last_event_at) {
            // A frame stamped before the last event counts as zero elapsed.
            if now.saturating_duration_since(last) < cooldown {
                self.suppressed += 1;
                return None;
            }
        }

        let event = DetectionEvent {
            sequence: self.next_sequence,
            timestamp: now,
            trigger: detection.clone(),
        };
        self.next_sequence += 1;
        self.last_event_at = Some(now);
        self.state = DebounceState::Cooldown;
        Some(event)
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn bus(confidence: f32, at: Instant) -> Detection {
        Detection::new(
            5,
            "bus",
            confidence,
            BoundingBox::new(0.1, 0.2, 0.7, 0.7),
            at,
        )
        .unwrap()
    }

    #[test]
    fn suppresses_within_cooldown_and_rearms_after() {
        let t0 = Instant::now();
        let cooldown = Duration::from_secs(30);
        let mut debouncer = Debouncer::new();
        let mut events = Vec::new();
        for (secs, conf) in [(0, 0.85), (5, 0.9), (40, 0.75)] {
            let at = t0 + Duration::from_secs(secs);
            if let Some(event) = debouncer.observe(Some(&bus(conf, at)), at, cooldown) {
                events.push((secs, event.sequence));
            }
        }
        assert_eq!(events, vec![(0, 1), (40, 2)]);
        assert_eq!(debouncer.suppressed(), 1);
    }

    #[test]
    fn empty_cycles_do_not_touch_state() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new();
        assert!(debouncer
            .observe(None, t0, Duration::from_secs(1))
            .is_none());
        assert_eq!(debouncer.state(), DebounceState::Idle);
        assert!(debouncer.last_event_at().is_none());
    }

    #[test]
    fn exactly_cooldown_elapsed_rearms() {
        let t0 = Instant::now();
        let cooldown = Duration::from_secs(10);
        let mut debouncer = Debouncer::new();
        assert!(debouncer.observe(Some(&bus(0.9, t0)), t0, cooldown).is_some());
        let at = t0 + cooldown;
        let event = debouncer.observe(Some(&bus(0.9, at)), at, cooldown).unwrap();
        assert_eq!(event.sequence, 2);
        assert_eq!(event.timestamp, at);
    }

    #[test]
    fn continuous_stream_yields_one_event_per_window() {
        let t0 = Instant::now();
        let cooldown = Duration::from_secs(30);
        let mut debouncer = Debouncer::new();
        let mut stamps = Vec::new();
        // 10 fps for 300 s: ten cooldown windows.
        for i in 0..3000u64 {
            let at = t0 + Duration::from_millis(i * 100);
            if let Some(event) = debouncer.observe(Some(&bus(0.9, at)), at, cooldown) {
                stamps.push(event.timestamp);
            }
        }
        assert!((9..=11).contains(&stamps.len()), "got {}", stamps.len());
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= cooldown);
        }
    }
}
