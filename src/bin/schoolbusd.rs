//! schoolbusd - school bus detection daemon.
//!
//! 1. Loads config (file + `SCHOOLBUS_*` env overrides)
//! 2. Opens the frame source and detector backend
//! 3. Connects to MQTT, publishes Home Assistant discovery
//! 4. Runs the pipeline until Ctrl-C, then switches devices off and exits

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use schoolbus_watch::automation::build_devices;
use schoolbus_watch::config::AppConfig;
use schoolbus_watch::detect::{BackendRegistry, DetectorAdapter};
use schoolbus_watch::ingest::open_source;
use schoolbus_watch::pipeline::{Pipeline, ShutdownSignal};
use schoolbus_watch::telemetry::{publish_discovery, LogSink, MqttSink, TelemetrySink};
use schoolbus_watch::transport::{MessagePublisher, MqttLink, Topics};
use schoolbus_watch::ConfigHandle;

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch a camera for school buses and drive Home Assistant")]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "SCHOOLBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Skip MQTT: telemetry and device commands are only logged.
    #[arg(long)]
    no_mqtt: bool,

    /// Do not publish Home Assistant discovery configs.
    #[arg(long)]
    no_discovery: bool,

    /// Override the camera URL (`stub://name` or `/dev/videoN`).
    #[arg(long)]
    camera: Option<String>,

    /// Override the MQTT broker address.
    #[arg(long)]
    mqtt_broker_addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = AppConfig::load(args.config.as_deref())?;
    if let Some(camera) = args.camera {
        cfg.camera.url = camera;
    }
    if let Some(addr) = args.mqtt_broker_addr {
        cfg.mqtt.broker_addr = addr;
    }
    if args.no_mqtt {
        cfg.mqtt.enabled = false;
    }
    if args.no_discovery {
        cfg.mqtt.discovery = false;
    }

    let source = open_source(&cfg.camera)?;
    let backend = BackendRegistry::builtin()
        .build(&cfg.detector)
        .context("detector backend")?;
    let detector = DetectorAdapter::new(backend, cfg.detector.class_labels());

    let (control_tx, control_rx) = mpsc::channel();
    let link = if cfg.mqtt.enabled {
        Some(Arc::new(MqttLink::connect(&cfg.mqtt, Some(control_tx))?))
    } else {
        log::warn!("mqtt disabled: devices and telemetry only log");
        None
    };
    let publisher = link
        .as_ref()
        .map(|link| Arc::clone(link) as Arc<dyn MessagePublisher>);

    let topics = Topics::new(&cfg.mqtt.topic_prefix);
    let sink: Arc<dyn TelemetrySink> = match &publisher {
        Some(publisher) => Arc::new(MqttSink::new(
            Arc::clone(publisher),
            topics.clone(),
            cfg.telemetry.queue_capacity,
        )?),
        None => Arc::new(LogSink),
    };
    if let (Some(publisher), true) = (&publisher, cfg.mqtt.discovery) {
        if let Err(err) = publish_discovery(
            publisher.as_ref(),
            &cfg.mqtt,
            &topics,
            cfg.pipeline.cooldown.as_secs(),
        ) {
            log::warn!("home assistant discovery failed: {:#}", err);
        }
    }

    let devices = build_devices(&cfg.devices, &cfg.mqtt.topic_prefix, publisher);
    log::info!(
        "{} devices configured, activation={:?} hold={:?} cooldown={:?}",
        devices.len(),
        cfg.pipeline.activation_order,
        cfg.pipeline.activation_duration,
        cfg.pipeline.cooldown
    );

    let config = ConfigHandle::new(cfg.pipeline.clone(), cfg.source.clone());
    let pipeline = Pipeline::new(
        source,
        detector,
        devices,
        config,
        cfg.runtime.clone(),
        cfg.telemetry.clone(),
        sink,
    )?
    .with_control(control_rx);

    let shutdown = Arc::new(ShutdownSignal::new());
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            shutdown.trigger();
        })
        .expect("error setting Ctrl-C handler");
    }

    let report = pipeline.run(&shutdown);
    log::info!(
        "stopped after {} cycles (devices released: {}, telemetry dropped: {})",
        report.cycles,
        report.devices_released,
        report.telemetry_dropped
    );

    if let Some(link) = link {
        link.disconnect()?;
    }
    Ok(())
}
