mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use schoolbus_watch::automation::{
    CommandError, DesiredState, Device, DeviceCategory, Dispatcher, EventEffect, Phase,
};
use schoolbus_watch::config::{ActivationOrder, DeactivationOrder, PipelineConfig};
use schoolbus_watch::debounce::DetectionEvent;
use schoolbus_watch::detect::{BoundingBox, Detection};

use common::{calls, eventually, new_log, order, CallLog, CollectingObserver, RecordingDevice};

fn config(hold_ms: u64, activation: ActivationOrder) -> Arc<PipelineConfig> {
    Arc::new(PipelineConfig {
        activation_duration: Duration::from_millis(hold_ms),
        activation_order: activation,
        deactivation_order: DeactivationOrder::Reverse,
        stagger_delay: Duration::from_millis(10),
        ..PipelineConfig::default()
    })
}

fn event(sequence: u64, at: Instant) -> DetectionEvent {
    DetectionEvent {
        sequence,
        timestamp: at,
        trigger: Detection::new(5, "bus", 0.9, BoundingBox::new(0.1, 0.3, 0.7, 0.7), at)
            .unwrap(),
    }
}

fn three_devices(log: &CallLog) -> Vec<Arc<dyn Device>> {
    vec![
        Arc::new(RecordingDevice::new("porch", DeviceCategory::Light, log)),
        Arc::new(
            RecordingDevice::new("siren", DeviceCategory::Switch, log)
                .failing_on(DesiredState::On),
        ),
        Arc::new(RecordingDevice::new("phone", DeviceCategory::Notification, log)),
    ]
}

#[test]
fn one_failing_device_does_not_block_the_others() {
    let log = new_log();
    let observer = Arc::new(CollectingObserver::default());
    let cfg = config(200, ActivationOrder::Simultaneous);
    let dispatcher = Dispatcher::new(
        three_devices(&log),
        Arc::clone(&cfg),
        Duration::from_secs(1),
        observer.clone(),
    )
    .unwrap();

    let effect = dispatcher.dispatch(&event(1, Instant::now()), &cfg);
    assert_eq!(effect, Some(EventEffect::Started { session_id: 1 }));
    assert!(dispatcher.wait_for_phase(Phase::Holding, Duration::from_secs(2)));
    assert!(eventually(Duration::from_secs(3), || observer.archived().len() == 1));

    for id in ["porch", "siren", "phone"] {
        assert_eq!(calls(&log, id, DesiredState::On), 1, "{id} on");
        assert_eq!(calls(&log, id, DesiredState::Off), 1, "{id} off");
    }
    let session = &observer.archived()[0];
    assert_eq!(session.failures(), 1);
    assert_eq!(dispatcher.device_failures().get("siren"), Some(&1));
    assert_eq!(dispatcher.device_successes().get("porch"), Some(&2));

    let phases: Vec<Phase> = observer.phases().into_iter().map(|(_, p)| p).collect();
    for phase in [Phase::Activating, Phase::Holding, Phase::Deactivating] {
        assert!(phases.contains(&phase), "missing {:?} in {:?}", phase, phases);
    }
    assert!(dispatcher.shutdown(Duration::from_secs(1)));
}

#[test]
fn event_while_holding_extends_without_reissuing() {
    let log = new_log();
    let observer = Arc::new(CollectingObserver::default());
    let cfg = config(400, ActivationOrder::Simultaneous);
    let dispatcher = Dispatcher::new(
        three_devices(&log),
        Arc::clone(&cfg),
        Duration::from_secs(1),
        observer.clone(),
    )
    .unwrap();

    dispatcher.dispatch(&event(1, Instant::now()), &cfg);
    assert!(dispatcher.wait_for_phase(Phase::Holding, Duration::from_secs(2)));
    let first_deadline = dispatcher.session().and_then(|s| s.hold_until).unwrap();

    std::thread::sleep(Duration::from_millis(150));
    let second_at = Instant::now();
    let effect = dispatcher.dispatch(&event(2, second_at), &cfg);
    assert_eq!(effect, Some(EventEffect::Extended { session_id: 1 }));

    let session = dispatcher.session().unwrap();
    assert_eq!(session.hold_until, Some(second_at + cfg.activation_duration));
    assert!(session.hold_until.unwrap() > first_deadline);
    assert_eq!(session.extensions, 1);
    assert_eq!(dispatcher.sessions_started(), 1);

    assert!(eventually(Duration::from_secs(3), || observer.archived().len() == 1));
    for id in ["porch", "siren", "phone"] {
        assert_eq!(calls(&log, id, DesiredState::On), 1, "{id} on re-issued");
    }
    // The hold ran from the second event, not the first.
    let off_at = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, s, _)| *s == DesiredState::Off)
        .map(|(_, _, at)| *at)
        .min()
        .unwrap();
    assert!(off_at >= second_at + cfg.activation_duration);
    assert!(dispatcher.shutdown(Duration::from_secs(1)));
}

#[test]
fn sequential_order_by_priority_and_reverse_off() {
    let log = new_log();
    let observer = Arc::new(CollectingObserver::default());
    let cfg = config(50, ActivationOrder::Sequential);
    let devices: Vec<Arc<dyn Device>> = vec![
        Arc::new(RecordingDevice::new("phone", DeviceCategory::Notification, &log)),
        Arc::new(RecordingDevice::new("speaker", DeviceCategory::Announcement, &log)),
        Arc::new(RecordingDevice::new("porch", DeviceCategory::Light, &log)),
    ];
    let dispatcher =
        Dispatcher::new(devices, Arc::clone(&cfg), Duration::from_secs(1), observer.clone())
            .unwrap();

    dispatcher.manual_activate(&cfg);
    assert!(eventually(Duration::from_secs(3), || observer.archived().len() == 1));
    assert_eq!(order(&log, DesiredState::On), vec!["porch", "speaker", "phone"]);
    assert_eq!(order(&log, DesiredState::Off), vec!["phone", "speaker", "porch"]);
    assert!(dispatcher.shutdown(Duration::from_secs(1)));
}

#[test]
fn stalled_off_command_is_recorded_as_timeout() {
    let log = new_log();
    let observer = Arc::new(CollectingObserver::default());
    let cfg = config(200, ActivationOrder::Simultaneous);
    let devices: Vec<Arc<dyn Device>> = vec![
        Arc::new(RecordingDevice::new("porch", DeviceCategory::Light, &log)),
        Arc::new(
            RecordingDevice::new("slow", DeviceCategory::Switch, &log)
                .stalling(Duration::from_millis(600)),
        ),
    ];
    let dispatcher = Dispatcher::new(
        devices,
        Arc::clone(&cfg),
        Duration::from_millis(100),
        observer.clone(),
    )
    .unwrap();

    dispatcher.dispatch(&event(1, Instant::now()), &cfg);
    // Activation does not wait for the slow "on" outcome.
    assert!(dispatcher.wait_for_phase(Phase::Holding, Duration::from_millis(400)));
    assert!(eventually(Duration::from_secs(3), || observer.archived().len() == 1));

    let session = &observer.archived()[0];
    let timed_out: Vec<_> = session
        .outcomes
        .iter()
        .filter(|o| o.result == Err(CommandError::Timeout))
        .map(|o| o.device_id.as_str())
        .collect();
    assert!(timed_out.contains(&"slow"));
    assert!(!timed_out.contains(&"porch"));
    assert!(dispatcher.shutdown(Duration::from_secs(2)));
}

#[test]
fn manual_deactivate_ends_hold_early() {
    let log = new_log();
    let observer = Arc::new(CollectingObserver::default());
    let cfg = config(60_000, ActivationOrder::Simultaneous);
    let dispatcher = Dispatcher::new(
        three_devices(&log),
        Arc::clone(&cfg),
        Duration::from_secs(1),
        observer.clone(),
    )
    .unwrap();

    assert!(!dispatcher.manual_deactivate());
    dispatcher.manual_activate(&cfg);
    assert!(dispatcher.wait_for_phase(Phase::Holding, Duration::from_secs(2)));
    assert!(dispatcher.manual_deactivate());
    assert!(dispatcher.wait_for_phase(Phase::Idle, Duration::from_secs(3)));
    assert!(eventually(Duration::from_secs(1), || observer.archived().len() == 1));
    assert_eq!(calls(&log, "porch", DesiredState::Off), 1);
    assert!(dispatcher.shutdown(Duration::from_secs(1)));
}

#[test]
fn shutdown_switches_devices_off() {
    let log = new_log();
    let observer = Arc::new(CollectingObserver::default());
    let cfg = config(60_000, ActivationOrder::Simultaneous);
    let dispatcher = Dispatcher::new(
        three_devices(&log),
        Arc::clone(&cfg),
        Duration::from_secs(1),
        observer.clone(),
    )
    .unwrap();

    dispatcher.dispatch(&event(1, Instant::now()), &cfg);
    assert!(dispatcher.wait_for_phase(Phase::Holding, Duration::from_secs(2)));
    assert!(dispatcher.shutdown(Duration::from_secs(3)));
    assert_eq!(dispatcher.phase(), Phase::Idle);
    for id in ["porch", "siren", "phone"] {
        assert_eq!(calls(&log, id, DesiredState::Off), 1, "{id} left on");
    }
    assert!(dispatcher.dispatch(&event(2, Instant::now()), &cfg).is_none());
}

#[test]
fn oversized_hold_still_releases_on_shutdown() {
    let log = new_log();
    let observer = Arc::new(CollectingObserver::default());
    let cfg = Arc::new(PipelineConfig {
        activation_duration: Duration::from_secs(u64::MAX),
        ..PipelineConfig::default()
    });
    let dispatcher = Dispatcher::new(
        three_devices(&log),
        Arc::clone(&cfg),
        Duration::from_secs(1),
        observer.clone(),
    )
    .unwrap();

    dispatcher.manual_activate(&cfg);
    assert!(dispatcher.wait_for_phase(Phase::Holding, Duration::from_secs(2)));
    assert_eq!(
        dispatcher.dispatch(&event(1, Instant::now()), &cfg),
        Some(EventEffect::Extended { session_id: 1 })
    );
    assert_eq!(dispatcher.phase(), Phase::Holding);

    assert!(dispatcher.shutdown(Duration::from_secs(3)));
    assert_eq!(dispatcher.phase(), Phase::Idle);
    for id in ["porch", "siren", "phone"] {
        assert_eq!(calls(&log, id, DesiredState::Off), 1, "{id} left on");
    }
}
