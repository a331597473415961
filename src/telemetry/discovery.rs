//! Home Assistant MQTT discovery for the detector's own entities.

use anyhow::Result;
use serde::Serialize;

use crate::config::MqttSettings;
use crate::transport::{MessagePublisher, Topics, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

#[derive(Serialize)]
struct HaSensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

#[derive(Serialize)]
struct HaBinarySensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    value_template: String,
    device_class: String,
    /// Seconds until HA flips the sensor back off; detections are only ever "on".
    off_delay: u64,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

#[derive(Clone, Serialize)]
struct HaDeviceInfo {
    identifiers: Vec<String>,
    name: String,
    manufacturer: String,
    model: String,
    sw_version: String,
}

pub fn sanitize_for_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Publish retained discovery configs. Returns the config topics written.
pub fn publish_discovery(
    publisher: &dyn MessagePublisher,
    settings: &MqttSettings,
    topics: &Topics,
    off_delay_secs: u64,
) -> Result<Vec<String>> {
    let node = sanitize_for_id(&settings.client_id);
    let prefix = settings.discovery_prefix.trim_end_matches('/');
    let device = HaDeviceInfo {
        identifiers: vec![node.clone()],
        name: settings.device_name.clone(),
        manufacturer: "schoolbus-watch".to_string(),
        model: "Bus detector".to_string(),
        sw_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let availability = topics.availability();
    let mut written = Vec::new();

    let detected = HaBinarySensorConfig {
        name: "School Bus Detected".to_string(),
        unique_id: format!("{}_detected", node),
        state_topic: topics.detection(),
        value_template: "{{ 'ON' if value_json.detected else 'OFF' }}".to_string(),
        device_class: "motion".to_string(),
        off_delay: off_delay_secs.max(1),
        availability_topic: availability.clone(),
        payload_available: PAYLOAD_ONLINE.to_string(),
        payload_not_available: PAYLOAD_OFFLINE.to_string(),
        device: device.clone(),
    };
    let topic = format!("{}/binary_sensor/{}/detected/config", prefix, node);
    publisher.publish(&topic, serde_json::to_vec(&detected)?, true)?;
    written.push(topic);

    let sensors = [
        (
            "confidence",
            "Detection Confidence",
            topics.detection(),
            "{{ value_json.confidence | round(2) }}",
            "mdi:bus-school",
        ),
        (
            "health",
            "Pipeline Health",
            topics.status(),
            "{{ value_json.health }}",
            "mdi:heart-pulse",
        ),
        (
            "session",
            "Automation Phase",
            topics.status(),
            "{{ value_json.session_phase }}",
            "mdi:lightbulb-auto",
        ),
    ];
    for (key, name, state_topic, template, icon) in sensors {
        let config = HaSensorConfig {
            name: name.to_string(),
            unique_id: format!("{}_{}", node, key),
            json_attributes_topic: (key != "confidence").then(|| state_topic.clone()),
            state_topic,
            value_template: Some(template.to_string()),
            unit_of_measurement: None,
            icon: Some(icon.to_string()),
            availability_topic: availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: device.clone(),
        };
        let topic = format!("{}/sensor/{}/{}/config", prefix, node, key);
        publisher.publish(&topic, serde_json::to_vec(&config)?, true)?;
        written.push(topic);
    }

    log::info!("published HA discovery for {} entities", written.len());
    Ok(written)
}
