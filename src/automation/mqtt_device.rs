//! Devices driven by MQTT command topics (Home Assistant / zigbee2mqtt style).

use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::DeviceSettings;
use crate::telemetry::unix_now;
use crate::transport::MessagePublisher;

use super::device::{CommandError, CommandParams, DesiredState, Device, DeviceCategory};

const DEFAULT_NOTIFY_TOPIC: &str = "homeassistant/notify";
const DEFAULT_ANNOUNCEMENT: &str = "School bus detected in front of the house";
const NOTIFICATION_TITLE: &str = "School Bus Alert";

pub struct MqttDevice {
    settings: DeviceSettings,
    topic_prefix: String,
    publisher: Arc<dyn MessagePublisher>,
}

impl MqttDevice {
    pub fn new(
        settings: DeviceSettings,
        topic_prefix: impl Into<String>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            settings,
            topic_prefix: topic_prefix.into(),
            publisher,
        }
    }

    /// Topic and JSON body for a command, or `None` when this device has
    /// nothing to do for `state` (announcements only speak on arrival).
    pub fn command(&self, state: DesiredState, params: &CommandParams) -> Option<(String, Value)> {
        let entity = self.settings.entity.as_deref().unwrap_or_default();
        match (self.settings.category, state) {
            (DeviceCategory::Light, DesiredState::On) => Some((
                format!("{}/set", entity),
                json!({"state": "ON", "brightness": 255, "transition": 1}),
            )),
            (DeviceCategory::Light, DesiredState::Off) => Some((
                format!("{}/set", entity),
                json!({"state": "OFF", "transition": 2}),
            )),
            (DeviceCategory::Switch, _) => Some((
                format!("{}/set", entity),
                json!({"state": if state == DesiredState::On { "ON" } else { "OFF" }}),
            )),
            (DeviceCategory::Announcement, DesiredState::On) => Some((
                format!("{}/announcement", self.topic_prefix),
                json!({
                    "message": self.settings.message.as_deref().unwrap_or(DEFAULT_ANNOUNCEMENT),
                    "priority": "high",
                    "timestamp": unix_now(),
                }),
            )),
            (DeviceCategory::Announcement, DesiredState::Off) => None,
            (DeviceCategory::Notification, _) => {
                let message = match (state, params.confidence) {
                    (DesiredState::On, Some(conf)) => format!(
                        "{} (confidence {:.0}%)",
                        self.settings.message.as_deref().unwrap_or(DEFAULT_ANNOUNCEMENT),
                        conf * 100.0
                    ),
                    (DesiredState::On, None) => "Bus alert activated manually".to_string(),
                    (DesiredState::Off, _) => "Bus alert cleared".to_string(),
                };
                let topic = self
                    .settings
                    .entity
                    .clone()
                    .unwrap_or_else(|| DEFAULT_NOTIFY_TOPIC.to_string());
                Some((
                    topic,
                    json!({
                        "title": NOTIFICATION_TITLE,
                        "message": message,
                        "data": {
                            "priority": "high",
                            "tag": "school_bus",
                            "session": params.session_id,
                        },
                    }),
                ))
            }
        }
    }
}

impl Device for MqttDevice {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn category(&self) -> DeviceCategory {
        self.settings.category
    }

    fn priority(&self) -> u8 {
        self.settings
            .priority
            .unwrap_or_else(|| self.settings.category.default_priority())
    }

    fn set_state(&self, state: DesiredState, params: &CommandParams) -> Result<(), CommandError> {
        let Some((topic, body)) = self.command(state, params) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|err| CommandError::Rejected(format!("encode payload: {}", err)))?;
        self.publisher
            .publish(&topic, payload, false)
            .map_err(|err| CommandError::Unreachable(format!("{:#}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingPublisher;

    fn device(
        category: DeviceCategory,
        entity: Option<&str>,
    ) -> (MqttDevice, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let settings = DeviceSettings {
            id: "dev".to_string(),
            category,
            entity: entity.map(str::to_string),
            priority: None,
            message: None,
        };
        let device = MqttDevice::new(settings, "schoolbus", publisher.clone());
        (device, publisher)
    }

    #[test]
    fn light_commands_match_home_assistant_schema() {
        let (light, publisher) = device(DeviceCategory::Light, Some("zigbee2mqtt/porch"));
        let params = CommandParams::default();
        light.set_state(DesiredState::On, &params).unwrap();
        light.set_state(DesiredState::Off, &params).unwrap();
        let sent = publisher.messages();
        assert_eq!(sent[0].0, "zigbee2mqtt/porch/set");
        let on: Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(on, json!({"state": "ON", "brightness": 255, "transition": 1}));
        let off: Value = serde_json::from_slice(&sent[1].1).unwrap();
        assert_eq!(off, json!({"state": "OFF", "transition": 2}));
    }

    #[test]
    fn announcements_only_speak_on_activation() {
        let (speaker, publisher) = device(DeviceCategory::Announcement, None);
        speaker
            .set_state(DesiredState::On, &CommandParams::default())
            .unwrap();
        speaker
            .set_state(DesiredState::Off, &CommandParams::default())
            .unwrap();
        let sent = publisher.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "schoolbus/announcement");
        let body: Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(body["priority"], "high");
        assert!(body["timestamp"].as_f64().is_some_and(|t| t > 0.0));
    }

    #[test]
    fn notifications_include_confidence() {
        let (notify, _) = device(DeviceCategory::Notification, None);
        let params = CommandParams {
            session_id: 4,
            confidence: Some(0.87),
        };
        let (topic, body) = notify.command(DesiredState::On, &params).unwrap();
        assert_eq!(topic, "homeassistant/notify");
        assert!(body["message"].as_str().unwrap().contains("87%"));
        assert_eq!(body["data"]["session"], 4);
    }

    #[test]
    fn publish_failure_is_unreachable() {
        let (switch, publisher) = device(DeviceCategory::Switch, Some("plug/siren"));
        publisher.fail_next("broker gone");
        let err = switch
            .set_state(DesiredState::On, &CommandParams::default())
            .unwrap_err();
        assert!(matches!(err, CommandError::Unreachable(reason) if reason.contains("broker gone")));
    }
}
