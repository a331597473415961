//! Threaded automation dispatcher.
//!
//! One worker thread drives the `ActivationMachine`; every device command runs
//! on its own short-lived thread and reports back through `complete`. All
//! machine state sits behind a single mutex, so the coordinator (events,
//! manual commands) and command completions never mutate a session at the same
//! time. Observer callbacks always run with the lock released.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::{ActivationOrder, DeactivationOrder, PipelineConfig};
use crate::debounce::DetectionEvent;

use super::device::{CommandError, CommandParams, DesiredState, Device};
use super::machine::{deadline_after, ActivationMachine, EventEffect};
use super::session::{ActivationSession, CommandOutcome, Phase, Trigger};

/// Receives session progress. Implementations must not block.
pub trait SessionObserver: Send + Sync {
    /// Called after every phase change with a snapshot of the session.
    fn on_phase(&self, session: &ActivationSession);

    /// Called once the session is back to IDLE.
    fn on_archived(&self, session: &ActivationSession);

    fn on_command(&self, _outcome: &CommandOutcome) {}
}

pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_phase(&self, _session: &ActivationSession) {}
    fn on_archived(&self, _session: &ActivationSession) {}
}

enum Notice {
    Phase(ActivationSession),
    Archived(ActivationSession),
}

struct Pending {
    session_id: u64,
    device_id: String,
    requested: DesiredState,
}

struct DispatchState {
    machine: ActivationMachine,
    config: Arc<PipelineConfig>,
    outstanding: Vec<Pending>,
    /// Session whose "off" commands are out, and when to stop waiting for them.
    off_issued: Option<(u64, Instant)>,
    successes: BTreeMap<String, u64>,
    failures: BTreeMap<String, u64>,
    stopping: bool,
    worker_done: bool,
}

struct Shared {
    state: Mutex<DispatchState>,
    wake: Condvar,
    devices: Vec<Arc<dyn Device>>,
    observer: Arc<dyn SessionObserver>,
    command_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for<'a>(
        &self,
        guard: MutexGuard<'a, DispatchState>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, DispatchState> {
        match timeout {
            Some(timeout) => {
                self.wake
                    .wait_timeout(guard, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn emit(&self, notices: Vec<Notice>) {
        self.wake.notify_all();
        for notice in notices {
            match notice {
                Notice::Phase(session) => self.observer.on_phase(&session),
                Notice::Archived(session) => self.observer.on_archived(&session),
            }
        }
    }

    fn complete(
        &self,
        session_id: u64,
        device_id: &str,
        requested: DesiredState,
        result: Result<(), CommandError>,
    ) {
        let outcome = {
            let mut state = self.lock();
            let Some(index) = state.outstanding.iter().position(|p| {
                p.session_id == session_id && p.device_id == device_id && p.requested == requested
            }) else {
                log::debug!(
                    "late {} outcome from {} for archived session {}",
                    requested.as_str(),
                    device_id,
                    session_id
                );
                return;
            };
            state.outstanding.swap_remove(index);
            let outcome = CommandOutcome {
                device_id: device_id.to_string(),
                requested,
                result,
                at: Instant::now(),
            };
            let counter = if outcome.succeeded() {
                &mut state.successes
            } else {
                &mut state.failures
            };
            *counter.entry(device_id.to_string()).or_default() += 1;
            state.machine.record(session_id, outcome.clone());
            self.wake.notify_all();
            outcome
        };
        if let Err(err) = &outcome.result {
            log::warn!(
                "session {}: {} {} failed: {}",
                session_id,
                device_id,
                requested.as_str(),
                err
            );
        }
        self.observer.on_command(&outcome);
    }
}

/// Non-blocking front end for the activation state machine.
pub struct Dispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        devices: Vec<Arc<dyn Device>>,
        config: Arc<PipelineConfig>,
        command_timeout: Duration,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(DispatchState {
                machine: ActivationMachine::new(),
                config,
                outstanding: Vec::new(),
                off_issued: None,
                successes: BTreeMap::new(),
                failures: BTreeMap::new(),
                stopping: false,
                worker_done: false,
            }),
            wake: Condvar::new(),
            devices,
            observer,
            command_timeout,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || run_worker(worker_shared))
            .context("failed to spawn dispatcher thread")?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Hand over a debounced event. Returns immediately; `None` once shutting down.
    pub fn dispatch(
        &self,
        event: &DetectionEvent,
        config: &Arc<PipelineConfig>,
    ) -> Option<EventEffect> {
        let trigger = Trigger::Event {
            sequence: event.sequence,
            class_name: event.trigger.class_name().to_string(),
            confidence: event.trigger.confidence(),
        };
        self.submit(trigger, event.timestamp, config)
    }

    /// Manual "activate" from the control channel.
    pub fn manual_activate(&self, config: &Arc<PipelineConfig>) -> Option<EventEffect> {
        self.submit(Trigger::Manual, Instant::now(), config)
    }

    /// Manual "deactivate": end the hold now. False when idle.
    pub fn manual_deactivate(&self) -> bool {
        let mut state = self.shared.lock();
        let ended = state.machine.end_hold(Instant::now());
        self.shared.wake.notify_all();
        ended
    }

    fn submit(
        &self,
        trigger: Trigger,
        at: Instant,
        config: &Arc<PipelineConfig>,
    ) -> Option<EventEffect> {
        let (effect, snapshot) = {
            let mut state = self.shared.lock();
            if state.stopping {
                return None;
            }
            state.config = Arc::clone(config);
            let effect = state
                .machine
                .on_event(trigger, at, config.activation_duration);
            let snapshot = match effect {
                EventEffect::Started { .. } => state.machine.session().cloned(),
                _ => None,
            };
            self.shared.wake.notify_all();
            (effect, snapshot)
        };
        if let Some(session) = snapshot {
            self.shared.observer.on_phase(&session);
        }
        Some(effect)
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().machine.phase()
    }

    pub fn session(&self) -> Option<ActivationSession> {
        self.shared.lock().machine.session().cloned()
    }

    pub fn sessions_started(&self) -> u64 {
        self.shared.lock().machine.sessions_started()
    }

    /// Failed commands per device since start.
    pub fn device_failures(&self) -> BTreeMap<String, u64> {
        self.shared.lock().failures.clone()
    }

    pub fn device_successes(&self) -> BTreeMap<String, u64> {
        self.shared.lock().successes.clone()
    }

    /// Block until the dispatcher reaches `phase` or `timeout` passes.
    pub fn wait_for_phase(&self, phase: Phase, timeout: Duration) -> bool {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut state = self.shared.lock();
        loop {
            if state.machine.phase() == phase {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.shared.wait_for(state, Some(deadline - now));
        }
    }

    /// Stop taking events, cut any hold short and wait up to `grace` for the
    /// "off" sequence to finish. Returns false if the grace period ran out.
    pub fn shutdown(&self, grace: Duration) -> bool {
        let deadline = deadline_after(Instant::now(), grace);
        let mut state = self.shared.lock();
        state.stopping = true;
        if state.machine.end_hold(Instant::now()) {
            log::info!("shutdown: ending active session early");
        }
        self.shared.wake.notify_all();
        loop {
            if state.worker_done {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "shutdown: dispatcher still {} after {:?}, giving up",
                    state.machine.phase().as_str(),
                    grace
                );
                return false;
            }
            state = self.shared.wait_for(state, Some(deadline - now));
        }
        drop(state);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("dispatcher thread panicked");
            }
        }
        true
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.stopping = true;
        state.machine.end_hold(Instant::now());
        self.shared.wake.notify_all();
    }
}

/// Devices in issue order plus the gap between issuances.
pub fn activation_plan(
    devices: &[Arc<dyn Device>],
    order: ActivationOrder,
    stagger: Duration,
) -> (Vec<Arc<dyn Device>>, Option<Duration>) {
    match order {
        ActivationOrder::Simultaneous => (devices.to_vec(), None),
        ActivationOrder::Sequential => (by_priority(devices), Some(stagger)),
    }
}

pub fn deactivation_plan(
    devices: &[Arc<dyn Device>],
    activation: ActivationOrder,
    order: DeactivationOrder,
    stagger: Duration,
) -> (Vec<Arc<dyn Device>>, Option<Duration>) {
    match order {
        DeactivationOrder::Reverse => {
            let (mut plan, gap) = activation_plan(devices, activation, stagger);
            plan.reverse();
            (plan, gap)
        }
        DeactivationOrder::Simultaneous => (devices.to_vec(), None),
        DeactivationOrder::Sequential => (by_priority(devices), Some(stagger)),
    }
}

fn by_priority(devices: &[Arc<dyn Device>]) -> Vec<Arc<dyn Device>> {
    let mut sorted = devices.to_vec();
    sorted.sort_by_key(|d| std::cmp::Reverse(d.priority()));
    sorted
}

fn issue(
    shared: &Arc<Shared>,
    session_id: u64,
    requested: DesiredState,
    plan: Vec<Arc<dyn Device>>,
    gap: Option<Duration>,
    params: CommandParams,
) {
    for (index, device) in plan.into_iter().enumerate() {
        if index > 0 {
            if let Some(gap) = gap.filter(|g| !g.is_zero()) {
                std::thread::sleep(gap);
            }
        }
        let device_id = device.id().to_string();
        shared.lock().outstanding.push(Pending {
            session_id,
            device_id: device_id.clone(),
            requested,
        });

        let worker_shared = Arc::clone(shared);
        let worker_params = params.clone();
        let worker_device_id = device_id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("cmd-{}", device_id))
            .spawn(move || {
                let result = device.set_state(requested, &worker_params);
                worker_shared.complete(session_id, &worker_device_id, requested, result);
            });
        if let Err(err) = spawned {
            shared.complete(
                session_id,
                &device_id,
                requested,
                Err(CommandError::Unreachable(format!(
                    "failed to spawn command thread: {}",
                    err
                ))),
            );
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let mut state = shared.lock();
        let now = Instant::now();
        match state.machine.phase() {
            Phase::Idle => {
                if state.stopping {
                    state.worker_done = true;
                    shared.wake.notify_all();
                    return;
                }
                drop(shared.wait_for(state, None));
            }
            Phase::Activating => {
                let Some(session) = state.machine.session() else {
                    continue;
                };
                let session_id = session.id;
                let params = CommandParams {
                    session_id,
                    confidence: session.trigger.confidence(),
                };
                let (plan, gap) = activation_plan(
                    &shared.devices,
                    state.config.activation_order,
                    state.config.stagger_delay,
                );
                log::info!(
                    "session {}: activating {} device(s)",
                    session_id,
                    plan.len()
                );
                drop(state);
                issue(&shared, session_id, DesiredState::On, plan, gap, params);

                let mut state = shared.lock();
                let mut notices = Vec::new();
                if state.machine.on_activation_issued(Instant::now()) {
                    if let Some(session) = state.machine.session() {
                        notices.push(Notice::Phase(session.clone()));
                    }
                }
                drop(state);
                shared.emit(notices);
            }
            Phase::Holding => {
                if state.machine.poll(now) {
                    let notices: Vec<Notice> = state
                        .machine
                        .session()
                        .map(|s| Notice::Phase(s.clone()))
                        .into_iter()
                        .collect();
                    drop(state);
                    shared.emit(notices);
                    continue;
                }
                let wait = state
                    .machine
                    .hold_deadline()
                    .map(|deadline| deadline.saturating_duration_since(now));
                drop(shared.wait_for(state, wait));
            }
            Phase::Deactivating => {
                let Some(session) = state.machine.session() else {
                    continue;
                };
                let session_id = session.id;
                match state.off_issued {
                    Some((issued_for, deadline)) if issued_for == session_id => {
                        let waiting = state
                            .outstanding
                            .iter()
                            .any(|p| p.session_id == session_id);
                        if waiting && now < deadline {
                            drop(shared.wait_for(state, Some(deadline - now)));
                            continue;
                        }
                        let notices = finish_session(&mut state, session_id, now);
                        drop(state);
                        shared.emit(notices);
                    }
                    _ => {
                        let params = CommandParams {
                            session_id,
                            confidence: session.trigger.confidence(),
                        };
                        let (plan, gap) = deactivation_plan(
                            &shared.devices,
                            state.config.activation_order,
                            state.config.deactivation_order,
                            state.config.stagger_delay,
                        );
                        log::info!(
                            "session {}: deactivating {} device(s)",
                            session_id,
                            plan.len()
                        );
                        drop(state);
                        issue(&shared, session_id, DesiredState::Off, plan, gap, params);
                        let mut state = shared.lock();
                        let deadline = deadline_after(Instant::now(), shared.command_timeout);
                        state.off_issued = Some((session_id, deadline));
                    }
                }
            }
        }
    }
}

/// Record missing outcomes as timeouts and move the machine back to IDLE.
fn finish_session(state: &mut DispatchState, session_id: u64, now: Instant) -> Vec<Notice> {
    let (late, kept): (Vec<Pending>, Vec<Pending>) = std::mem::take(&mut state.outstanding)
        .into_iter()
        .partition(|p| p.session_id == session_id);
    state.outstanding = kept;
    for pending in late {
        log::warn!(
            "session {}: {} {} timed out",
            session_id,
            pending.device_id,
            pending.requested.as_str()
        );
        *state.failures.entry(pending.device_id.clone()).or_default() += 1;
        state.machine.record(
            session_id,
            CommandOutcome {
                device_id: pending.device_id,
                requested: pending.requested,
                result: Err(CommandError::Timeout),
                at: now,
            },
        );
    }
    state.off_issued = None;
    if state.stopping {
        state.machine.drop_queued();
    }

    let mut notices = Vec::new();
    if let Some((archived, restarted)) = state.machine.on_deactivation_complete(now) {
        log::info!(
            "session {}: complete ({} command failure(s), {} extension(s))",
            archived.id,
            archived.failures(),
            archived.extensions
        );
        notices.push(Notice::Archived(archived));
        if let Some(EventEffect::Started { .. }) = restarted {
            if let Some(session) = state.machine.session() {
                notices.push(Notice::Phase(session.clone()));
            }
        }
    }
    notices
}
