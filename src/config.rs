use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::automation::DeviceCategory;
use crate::detect::ClassLabels;

const DEFAULT_CAMERA_URL: &str = "stub://bus_stop";
const DEFAULT_CAMERA_WIDTH: u32 = 1280;
const DEFAULT_CAMERA_HEIGHT: u32 = 720;
const DEFAULT_CAMERA_FPS: u32 = 10;

const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;

const DEFAULT_MQTT_BROKER: &str = "localhost:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "schoolbus-watch";
const DEFAULT_TOPIC_PREFIX: &str = "schoolbus";
const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
const DEFAULT_DEVICE_NAME: &str = "School Bus Detector";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_MQTT_RECONNECT_SECS: f64 = 5.0;

const DEFAULT_TARGET_CLASSES: [&str; 2] = ["bus", "school_bus"];
const DEFAULT_MIN_CONFIDENCE: f32 = 0.7;
const DEFAULT_MIN_AREA: f32 = 0.1;
const DEFAULT_MIN_ASPECT: f32 = 0.3;
const DEFAULT_MAX_ASPECT: f32 = 8.0;
const DEFAULT_MAX_DETECTIONS: usize = 10;
const DEFAULT_COOLDOWN_SECS: f64 = 30.0;
const DEFAULT_ACTIVATION_SECS: f64 = 300.0;
const DEFAULT_STAGGER_MS: u64 = 500;

const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 500;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;
const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;
const DEFAULT_FAILURE_CEILING: u32 = 10;
const DEFAULT_SHUTDOWN_GRACE_SECS: f64 = 10.0;
const DEFAULT_COMMAND_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_CYCLE_PAUSE_MS: u64 = 50;

const DEFAULT_STATUS_INTERVAL_SECS: f64 = 30.0;
const DEFAULT_METRICS_INTERVAL_SECS: f64 = 60.0;
const DEFAULT_LATENCY_WINDOW: usize = 1_000;
const DEFAULT_MAX_INFERENCE_MS: f64 = 100.0;
const DEFAULT_MIN_FPS: f64 = 10.0;
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Upper bound for every configured duration (one week).
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ----------------------------------------------------------------------------
// File representation
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    camera: Option<CameraFile>,
    detector: Option<DetectorFile>,
    mqtt: Option<MqttFile>,
    detection: Option<DetectionFile>,
    automation: Option<AutomationFile>,
    devices: Option<Vec<DeviceFile>>,
    runtime: Option<RuntimeFile>,
    telemetry: Option<TelemetryFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    score_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttFile {
    enabled: Option<bool>,
    broker_addr: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: Option<String>,
    discovery: Option<bool>,
    discovery_prefix: Option<String>,
    device_name: Option<String>,
    keep_alive_secs: Option<u64>,
    reconnect_delay_secs: Option<f64>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionFile {
    target_classes: Option<Vec<String>>,
    min_confidence: Option<f32>,
    zone: Option<[f32; 4]>,
    min_area: Option<f32>,
    min_aspect_ratio: Option<f32>,
    max_aspect_ratio: Option<f32>,
    max_detections: Option<usize>,
    cooldown_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct AutomationFile {
    activation_duration_secs: Option<f64>,
    activation_order: Option<ActivationOrder>,
    deactivation_order: Option<DeactivationOrder>,
    stagger_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    id: String,
    category: DeviceCategory,
    entity: Option<String>,
    priority: Option<u8>,
    message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RuntimeFile {
    frame_timeout_ms: Option<u64>,
    inference_timeout_ms: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    failure_ceiling: Option<u32>,
    shutdown_grace_secs: Option<f64>,
    command_timeout_secs: Option<f64>,
    cycle_pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryFile {
    status_interval_secs: Option<f64>,
    metrics_interval_secs: Option<f64>,
    latency_window: Option<usize>,
    max_inference_ms: Option<f64>,
    min_fps: Option<f64>,
    queue_capacity: Option<usize>,
}

// ----------------------------------------------------------------------------
// Validated settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub mqtt: MqttSettings,
    pub pipeline: PipelineConfig,
    pub devices: Vec<DeviceSettings>,
    pub runtime: RuntimeSettings,
    pub telemetry: TelemetrySettings,
    /// File the config was read from, reused by `ConfigHandle::reload`.
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// `stub://<name>` or a V4L2 device path.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CAMERA_URL.to_string(),
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
            fps: DEFAULT_CAMERA_FPS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    /// Class names in model output order. `None` means COCO-80.
    pub labels: Option<Vec<String>>,
}

impl DetectorSettings {
    pub fn class_labels(&self) -> ClassLabels {
        match &self.labels {
            Some(names) => ClassLabels::from_names(names.iter().cloned()),
            None => ClassLabels::coco(),
        }
    }

    pub fn class_count(&self) -> usize {
        self.labels
            .as_ref()
            .map(|names| names.len())
            .unwrap_or(crate::detect::COCO_CLASSES.len())
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: None,
            input_width: DEFAULT_MODEL_INPUT,
            input_height: DEFAULT_MODEL_INPUT,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            labels: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub enabled: bool,
    pub broker_addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub discovery: bool,
    pub discovery_prefix: String,
    pub device_name: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            broker_addr: DEFAULT_MQTT_BROKER.to_string(),
            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            username: None,
            password: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            discovery: true,
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            reconnect_delay: Duration::from_secs_f64(DEFAULT_MQTT_RECONNECT_SECS),
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }
}

/// Order in which "on" commands are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOrder {
    /// All at once, no stagger.
    Simultaneous,
    /// One at a time by category priority, `stagger_delay` apart.
    Sequential,
}

/// Order in which "off" commands are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationOrder {
    /// Mirror of the activation order.
    Reverse,
    Simultaneous,
    Sequential,
}

/// Normalized rectangle a detection's center must fall inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Zone {
    pub const FULL_FRAME: Zone = Zone {
        x1: 0.0,
        y1: 0.0,
        x2: 1.0,
        y2: 1.0,
    };

    /// Edges are inclusive.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }
}

/// Hot-reloadable detection and automation parameters.
///
/// Never mutated once published; a reload builds and validates a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Bumped on every successful reload.
    pub version: u64,
    /// Lower-case class names that may trigger.
    pub target_classes: Vec<String>,
    pub min_confidence: f32,
    pub zone: Zone,
    /// Minimum box area as a fraction of the frame.
    pub min_area: f32,
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    pub max_detections: usize,
    pub cooldown: Duration,
    pub activation_duration: Duration,
    pub activation_order: ActivationOrder,
    pub deactivation_order: DeactivationOrder,
    pub stagger_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            target_classes: DEFAULT_TARGET_CLASSES.iter().map(|c| c.to_string()).collect(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            zone: Zone::FULL_FRAME,
            min_area: DEFAULT_MIN_AREA,
            min_aspect_ratio: DEFAULT_MIN_ASPECT,
            max_aspect_ratio: DEFAULT_MAX_ASPECT,
            max_detections: DEFAULT_MAX_DETECTIONS,
            cooldown: Duration::from_secs_f64(DEFAULT_COOLDOWN_SECS),
            activation_duration: Duration::from_secs_f64(DEFAULT_ACTIVATION_SECS),
            activation_order: ActivationOrder::Sequential,
            deactivation_order: DeactivationOrder::Reverse,
            stagger_delay: Duration::from_millis(DEFAULT_STAGGER_MS),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.min_confidence.is_finite() || !(0.0..=1.0).contains(&self.min_confidence) {
            bail!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            );
        }
        let z = &self.zone;
        let edges = [z.x1, z.y1, z.x2, z.y2];
        if edges
            .iter()
            .any(|v| !v.is_finite() || !(0.0..=1.0).contains(v))
        {
            bail!("zone coordinates must be within [0, 1], got {:?}", edges);
        }
        if z.x1 >= z.x2 || z.y1 >= z.y2 {
            bail!("zone must have x1 < x2 and y1 < y2, got {:?}", edges);
        }
        if !self.min_area.is_finite() || !(0.0..=1.0).contains(&self.min_area) {
            bail!("min_area must be within [0, 1], got {}", self.min_area);
        }
        if !self.min_aspect_ratio.is_finite()
            || !self.max_aspect_ratio.is_finite()
            || self.min_aspect_ratio <= 0.0
            || self.min_aspect_ratio > self.max_aspect_ratio
        {
            bail!(
                "aspect ratio band must satisfy 0 < min <= max, got [{}, {}]",
                self.min_aspect_ratio,
                self.max_aspect_ratio
            );
        }
        if self.max_detections == 0 {
            bail!("max_detections must be at least 1");
        }
        if self.target_classes.is_empty() {
            bail!("target_classes must not be empty");
        }
        if self.activation_duration.is_zero() {
            bail!("activation_duration must be greater than zero");
        }
        within_max("activation_duration", self.activation_duration)?;
        within_max("cooldown", self.cooldown)?;
        within_max("stagger_delay", self.stagger_delay)?;
        Ok(())
    }

    /// True when `class_name` is in the allowlist.
    pub fn targets(&self, class_name: &str) -> bool {
        self.target_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class_name))
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub id: String,
    pub category: DeviceCategory,
    /// Command topic base (lights and switches) or notify service (notifications).
    pub entity: Option<String>,
    /// Overrides the category priority for sequential ordering. Higher goes first.
    pub priority: Option<u8>,
    /// Announcement / notification text.
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub frame_timeout: Duration,
    pub inference_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures at which health turns fatal.
    pub failure_ceiling: u32,
    pub shutdown_grace: Duration,
    pub command_timeout: Duration,
    /// Minimum pause between cycles.
    pub cycle_pause: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
            inference_timeout: Duration::from_millis(DEFAULT_INFERENCE_TIMEOUT_MS),
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            failure_ceiling: DEFAULT_FAILURE_CEILING,
            shutdown_grace: Duration::from_secs_f64(DEFAULT_SHUTDOWN_GRACE_SECS),
            command_timeout: Duration::from_secs_f64(DEFAULT_COMMAND_TIMEOUT_SECS),
            cycle_pause: Duration::from_millis(DEFAULT_CYCLE_PAUSE_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub status_interval: Duration,
    pub metrics_interval: Duration,
    /// Inference latencies kept for the rolling average.
    pub latency_window: usize,
    pub max_inference_ms: f64,
    pub min_fps: f64,
    /// Outbound messages buffered before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs_f64(DEFAULT_STATUS_INTERVAL_SECS),
            metrics_interval: Duration::from_secs_f64(DEFAULT_METRICS_INTERVAL_SECS),
            latency_window: DEFAULT_LATENCY_WINDOW,
            max_inference_ms: DEFAULT_MAX_INFERENCE_MS,
            min_fps: DEFAULT_MIN_FPS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from `SCHOOLBUS_CONFIG`, or pure defaults.
    /// Environment overrides apply in every case.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env_nonempty("SCHOOLBUS_CONFIG").map(PathBuf::from));
        let file_cfg = match path.as_deref() {
            Some(path) => read_config_file(path)?,
            None => AppConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.source = path;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a config document without touching the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: AppConfigFile = toml::from_str(raw).context("invalid config")?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            url: camera_file
                .url
                .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            fps: camera_file.fps.unwrap_or(DEFAULT_CAMERA_FPS),
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detector_file.model_path,
            input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            score_threshold: detector_file
                .score_threshold
                .unwrap_or(DEFAULT_SCORE_THRESHOLD),
            nms_threshold: detector_file.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
            labels: detector_file.labels,
        };

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            enabled: mqtt_file.enabled.unwrap_or(true),
            broker_addr: mqtt_file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            username: mqtt_file.username,
            password: mqtt_file.password,
            topic_prefix: mqtt_file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            discovery: mqtt_file.discovery.unwrap_or(true),
            discovery_prefix: mqtt_file
                .discovery_prefix
                .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            device_name: mqtt_file
                .device_name
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
            keep_alive: Duration::from_secs(
                mqtt_file.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            ),
            reconnect_delay: seconds(
                "mqtt.reconnect_delay_secs",
                mqtt_file
                    .reconnect_delay_secs
                    .unwrap_or(DEFAULT_MQTT_RECONNECT_SECS),
            )?,
            ca_path: mqtt_file.ca_path,
            client_cert_path: mqtt_file.client_cert_path,
            client_key_path: mqtt_file.client_key_path,
        };

        let detection = file.detection.unwrap_or_default();
        let automation = file.automation.unwrap_or_default();
        let zone = detection.zone.unwrap_or([0.0, 0.0, 1.0, 1.0]);
        let pipeline = PipelineConfig {
            version: 1,
            target_classes: detection
                .target_classes
                .map(|classes| classes.iter().map(|c| c.trim().to_lowercase()).collect())
                .unwrap_or_else(|| {
                    DEFAULT_TARGET_CLASSES
                        .iter()
                        .map(|c| c.to_string())
                        .collect()
                }),
            min_confidence: detection.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            zone: Zone {
                x1: zone[0],
                y1: zone[1],
                x2: zone[2],
                y2: zone[3],
            },
            min_area: detection.min_area.unwrap_or(DEFAULT_MIN_AREA),
            min_aspect_ratio: detection.min_aspect_ratio.unwrap_or(DEFAULT_MIN_ASPECT),
            max_aspect_ratio: detection.max_aspect_ratio.unwrap_or(DEFAULT_MAX_ASPECT),
            max_detections: detection.max_detections.unwrap_or(DEFAULT_MAX_DETECTIONS),
            cooldown: seconds(
                "detection.cooldown_secs",
                detection.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
            )?,
            activation_duration: seconds(
                "automation.activation_duration_secs",
                automation
                    .activation_duration_secs
                    .unwrap_or(DEFAULT_ACTIVATION_SECS),
            )?,
            activation_order: automation
                .activation_order
                .unwrap_or(ActivationOrder::Sequential),
            deactivation_order: automation
                .deactivation_order
                .unwrap_or(DeactivationOrder::Reverse),
            stagger_delay: Duration::from_millis(
                automation.stagger_delay_ms.unwrap_or(DEFAULT_STAGGER_MS),
            ),
        };

        let devices = file
            .devices
            .unwrap_or_default()
            .into_iter()
            .map(|device| DeviceSettings {
                id: device.id,
                category: device.category,
                entity: device.entity,
                priority: device.priority,
                message: device.message,
            })
            .collect();

        let runtime_file = file.runtime.unwrap_or_default();
        let runtime = RuntimeSettings {
            frame_timeout: Duration::from_millis(
                runtime_file
                    .frame_timeout_ms
                    .unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
            ),
            inference_timeout: Duration::from_millis(
                runtime_file
                    .inference_timeout_ms
                    .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_MS),
            ),
            backoff_initial: Duration::from_millis(
                runtime_file
                    .backoff_initial_ms
                    .unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
            ),
            backoff_max: Duration::from_millis(
                runtime_file.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
            ),
            failure_ceiling: runtime_file
                .failure_ceiling
                .unwrap_or(DEFAULT_FAILURE_CEILING),
            shutdown_grace: seconds(
                "runtime.shutdown_grace_secs",
                runtime_file
                    .shutdown_grace_secs
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            )?,
            command_timeout: seconds(
                "runtime.command_timeout_secs",
                runtime_file
                    .command_timeout_secs
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            )?,
            cycle_pause: Duration::from_millis(
                runtime_file.cycle_pause_ms.unwrap_or(DEFAULT_CYCLE_PAUSE_MS),
            ),
        };

        let telemetry_file = file.telemetry.unwrap_or_default();
        let telemetry = TelemetrySettings {
            status_interval: seconds(
                "telemetry.status_interval_secs",
                telemetry_file
                    .status_interval_secs
                    .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
            )?,
            metrics_interval: seconds(
                "telemetry.metrics_interval_secs",
                telemetry_file
                    .metrics_interval_secs
                    .unwrap_or(DEFAULT_METRICS_INTERVAL_SECS),
            )?,
            latency_window: telemetry_file
                .latency_window
                .unwrap_or(DEFAULT_LATENCY_WINDOW),
            max_inference_ms: telemetry_file
                .max_inference_ms
                .unwrap_or(DEFAULT_MAX_INFERENCE_MS),
            min_fps: telemetry_file.min_fps.unwrap_or(DEFAULT_MIN_FPS),
            queue_capacity: telemetry_file
                .queue_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
        };

        Ok(Self {
            camera,
            detector,
            mqtt,
            pipeline,
            devices,
            runtime,
            telemetry,
            source: None,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty("SCHOOLBUS_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(backend) = env_nonempty("SCHOOLBUS_DETECTOR_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(model) = env_nonempty("SCHOOLBUS_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(model));
        }
        if let Some(addr) = env_nonempty("SCHOOLBUS_MQTT_BROKER") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(username) = env_nonempty("SCHOOLBUS_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = env_nonempty("SCHOOLBUS_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(raw) = env_nonempty("SCHOOLBUS_MIN_CONFIDENCE") {
            self.pipeline.min_confidence = raw
                .parse()
                .map_err(|_| anyhow!("SCHOOLBUS_MIN_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(raw) = env_nonempty("SCHOOLBUS_COOLDOWN_SECS") {
            let secs: f64 = raw
                .parse()
                .map_err(|_| anyhow!("SCHOOLBUS_COOLDOWN_SECS must be a number of seconds"))?;
            self.pipeline.cooldown = seconds("SCHOOLBUS_COOLDOWN_SECS", secs)?;
        }
        if let Some(raw) = env_nonempty("SCHOOLBUS_ACTIVATION_SECS") {
            let secs: f64 = raw
                .parse()
                .map_err(|_| anyhow!("SCHOOLBUS_ACTIVATION_SECS must be a number of seconds"))?;
            self.pipeline.activation_duration = seconds("SCHOOLBUS_ACTIVATION_SECS", secs)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.camera.width == 0 || self.camera.height == 0 {
            bail!("camera width and height must be greater than zero");
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            bail!("detector input size must be greater than zero");
        }
        for (name, value) in [
            ("detector.score_threshold", self.detector.score_threshold),
            ("detector.nms_threshold", self.detector.nms_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", name, value);
            }
        }
        if self.mqtt.topic_prefix.trim().is_empty() {
            bail!("mqtt.topic_prefix must not be empty");
        }
        if self.mqtt.client_cert_path.is_some() != self.mqtt.client_key_path.is_some() {
            bail!("mqtt.client_cert_path and mqtt.client_key_path must be set together");
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                bail!("device id must not be empty");
            }
            if !seen.insert(device.id.as_str()) {
                bail!("duplicate device id '{}'", device.id);
            }
            if device.category.needs_entity()
                && device
                    .entity
                    .as_deref()
                    .map_or(true, |e| e.trim().is_empty())
            {
                bail!("device '{}' needs an entity topic", device.id);
            }
        }
        if self.runtime.backoff_initial.is_zero()
            || self.runtime.backoff_initial > self.runtime.backoff_max
        {
            bail!("runtime backoff must satisfy 0 < initial <= max");
        }
        if self.runtime.failure_ceiling == 0 {
            bail!("runtime.failure_ceiling must be at least 1");
        }
        if self.runtime.frame_timeout.is_zero() || self.runtime.inference_timeout.is_zero() {
            bail!("frame and inference timeouts must be greater than zero");
        }
        if self.telemetry.status_interval.is_zero() || self.telemetry.metrics_interval.is_zero() {
            bail!("telemetry intervals must be greater than zero");
        }
        if self.telemetry.latency_window == 0 || self.telemetry.queue_capacity == 0 {
            bail!("telemetry latency_window and queue_capacity must be at least 1");
        }
        if self.mqtt.keep_alive > Duration::from_secs(u64::from(u16::MAX)) {
            bail!("mqtt.keep_alive_secs must be at most {}", u16::MAX);
        }
        let rt = &self.runtime;
        for (name, value) in [
            ("runtime.frame_timeout_ms", rt.frame_timeout),
            ("runtime.inference_timeout_ms", rt.inference_timeout),
            ("runtime.backoff_max_ms", rt.backoff_max),
            ("runtime.cycle_pause_ms", rt.cycle_pause),
        ] {
            within_max(name, value)?;
        }
        Ok(())
    }
}

/// Shared, swappable `PipelineConfig` snapshot.
///
/// Readers grab an `Arc` once per cycle and keep it for the whole cycle; a
/// swap only replaces the pointer, so nobody sees a half-updated config.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<PipelineConfig>>>,
    source: Option<PathBuf>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl ConfigHandle {
    pub fn new(config: PipelineConfig, source: Option<PathBuf>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            source,
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn snapshot(&self) -> Arc<PipelineConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validate `next` and publish it with the following version number.
    pub fn swap(&self, mut next: PipelineConfig) -> Result<Arc<PipelineConfig>> {
        if let Err(err) = next.validate() {
            self.set_error(Some(err.to_string()));
            return Err(err);
        }
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        next.version = guard.version + 1;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        drop(guard);
        self.set_error(None);
        Ok(next)
    }

    /// Re-read the config source (file + env). On failure the current snapshot stays.
    pub fn reload(&self) -> Result<Arc<PipelineConfig>> {
        let loaded = AppConfig::load(self.source.as_deref()).with_context(|| {
            format!(
                "config reload from {} rejected",
                self.source
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "defaults".to_string())
            )
        });
        match loaded {
            Ok(cfg) => self.swap(cfg.pipeline),
            Err(err) => {
                self.set_error(Some(format!("{:#}", err)));
                Err(err)
            }
        }
    }

    /// Error from the most recent rejected reload, cleared by the next good one.
    pub fn last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_error(&self, error: Option<String>) {
        let mut guard = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = error;
    }
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        bail!("{} must be a non-negative number of seconds, got {}", name, value);
    }
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if duration <= MAX_DURATION => Ok(duration),
        _ => bail!(
            "{} must be at most {} seconds, got {}",
            name,
            MAX_DURATION.as_secs(),
            value
        ),
    }
}

fn within_max(name: &str, value: Duration) -> Result<()> {
    if value > MAX_DURATION {
        bail!(
            "{} must be at most {} seconds, got {:?}",
            name,
            MAX_DURATION.as_secs(),
            value
        );
    }
    Ok(())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.pipeline.min_confidence, 0.7);
        assert_eq!(cfg.pipeline.cooldown, Duration::from_secs(30));
        assert_eq!(cfg.pipeline.activation_duration, Duration::from_secs(300));
        assert!(cfg.pipeline.targets("Bus"));
        assert_eq!(cfg.mqtt.topic_prefix, "schoolbus");
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn rejects_out_of_range_values() {
        for doc in [
            "[detection]\nmin_confidence = 1.5",
            "[detection]\nzone = [0.5, 0.0, 0.4, 1.0]",
            "[detection]\nzone = [0.0, 0.0, 1.2, 1.0]",
            "[detection]\ncooldown_secs = -1.0",
            "[detection]\nmax_detections = 0",
            "[detection]\ntarget_classes = []",
            "[detection]\nmin_aspect_ratio = 3.0\nmax_aspect_ratio = 2.0",
            "[automation]\nactivation_duration_secs = -5.0",
        ] {
            assert!(AppConfig::from_toml_str(doc).is_err(), "accepted: {doc}");
        }
    }

    #[test]
    fn rejects_durations_past_the_ceiling() {
        for doc in [
            "[detection]\ncooldown_secs = 1e30",
            "[automation]\nactivation_duration_secs = 1e19",
            "[automation]\nactivation_duration_secs = 700000.0",
            "[runtime]\nshutdown_grace_secs = 1e300",
            "[runtime]\ncommand_timeout_secs = 1e20",
            "[runtime]\nframe_timeout_ms = 9223372036854775807",
            "[telemetry]\nstatus_interval_secs = 1e25",
            "[mqtt]\nkeep_alive_secs = 100000",
        ] {
            let err = AppConfig::from_toml_str(doc).unwrap_err();
            assert!(err.to_string().contains("at most"), "{doc}: {err}");
        }
        let week = AppConfig::from_toml_str("[automation]\nactivation_duration_secs = 604800.0")
            .unwrap();
        assert_eq!(week.pipeline.activation_duration, MAX_DURATION);
    }

    #[test]
    fn swap_rejects_unbounded_hold() {
        let handle = ConfigHandle::new(PipelineConfig::default(), None);
        let huge = PipelineConfig {
            activation_duration: Duration::from_secs(u64::MAX),
            ..PipelineConfig::default()
        };
        assert!(handle.swap(huge).is_err());
        assert_eq!(handle.snapshot().version, 1);
    }

    #[test]
    fn reload_of_huge_cooldown_keeps_snapshot() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[detection]\ncooldown_secs = 12.0").unwrap();
        let cfg = AppConfig::load(Some(file.path())).unwrap();
        let handle = ConfigHandle::new(cfg.pipeline, Some(file.path().to_path_buf()));

        let path = file.path().to_path_buf();
        std::fs::write(&path, "[detection]\ncooldown_secs = 1e30\n").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().cooldown, Duration::from_secs(12));
        assert_eq!(handle.snapshot().version, 1);
        let error = handle.last_error().unwrap();
        assert!(error.contains("cooldown_secs"), "{error}");
    }

    #[test]
    fn parses_devices_and_orders() {
        let doc = r#"
            [automation]
            activation_order = "simultaneous"
            deactivation_order = "sequential"

            [[devices]]
            id = "porch"
            category = "light"
            entity = "zigbee2mqtt/porch_light"

            [[devices]]
            id = "speaker"
            category = "announcement"
            message = "The bus is here"
        "#;
        let cfg = AppConfig::from_toml_str(doc).unwrap();
        assert_eq!(cfg.pipeline.activation_order, ActivationOrder::Simultaneous);
        assert_eq!(cfg.pipeline.deactivation_order, DeactivationOrder::Sequential);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].category, DeviceCategory::Light);
        assert_eq!(cfg.devices[1].message.as_deref(), Some("The bus is here"));
    }

    #[test]
    fn lights_need_an_entity_and_ids_are_unique() {
        let missing = "[[devices]]\nid = \"porch\"\ncategory = \"light\"";
        assert!(AppConfig::from_toml_str(missing).is_err());
        let dup = r#"
            [[devices]]
            id = "a"
            category = "notification"
            [[devices]]
            id = "a"
            category = "notification"
        "#;
        assert!(AppConfig::from_toml_str(dup).is_err());
    }

    #[test]
    fn swap_bumps_version_and_rejects_invalid() {
        let handle = ConfigHandle::new(PipelineConfig::default(), None);
        let first = handle.snapshot();
        assert_eq!(first.version, 1);

        let next = PipelineConfig {
            min_confidence: 0.5,
            ..PipelineConfig::default()
        };
        let swapped = handle.swap(next).unwrap();
        assert_eq!(swapped.version, 2);
        assert_eq!(handle.snapshot().min_confidence, 0.5);
        // The old snapshot is untouched.
        assert_eq!(first.min_confidence, 0.7);

        let bad = PipelineConfig {
            min_confidence: -0.1,
            ..PipelineConfig::default()
        };
        assert!(handle.swap(bad).is_err());
        assert_eq!(handle.snapshot().version, 2);
        assert!(handle.last_error().is_some());
    }

    #[test]
    fn zone_edges_are_inclusive() {
        let zone = Zone {
            x1: 0.2,
            y1: 0.2,
            x2: 0.8,
            y2: 0.8,
        };
        assert!(zone.contains(0.2, 0.8));
        assert!(!zone.contains(0.1, 0.5));
    }
}
