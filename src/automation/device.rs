use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On or off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    On,
    Off,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::On => "on",
            DesiredState::Off => "off",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Light,
    Switch,
    /// Media player / text-to-speech.
    Announcement,
    Notification,
}

impl DeviceCategory {
    /// Sequential issue order, higher first.
    pub fn default_priority(&self) -> u8 {
        match self {
            DeviceCategory::Light => 40,
            DeviceCategory::Switch => 30,
            DeviceCategory::Announcement => 20,
            DeviceCategory::Notification => 10,
        }
    }

    /// Categories addressed through their own command topic.
    pub fn needs_entity(&self) -> bool {
        matches!(self, DeviceCategory::Light | DeviceCategory::Switch)
    }
}

/// What caused a command, carried into payloads that show text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandParams {
    pub session_id: u64,
    /// Confidence of the triggering detection; `None` for manual sessions.
    pub confidence: Option<f32>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("no outcome within the command timeout")]
    Timeout,
}

/// A controllable target: light, switch, speaker, notifier.
///
/// `set_state` may block (it runs on its own thread) but should give up on
/// its own well before the dispatcher's command timeout.
pub trait Device: Send + Sync {
    fn id(&self) -> &str;

    fn category(&self) -> DeviceCategory;

    /// Sequential issue priority, higher first.
    fn priority(&self) -> u8 {
        self.category().default_priority()
    }

    fn set_state(&self, state: DesiredState, params: &CommandParams) -> Result<(), CommandError>;
}

/// Logs every command and reports success. Used when MQTT is disabled.
pub struct LogDevice {
    id: String,
    category: DeviceCategory,
    priority: Option<u8>,
}

impl LogDevice {
    pub fn new(id: impl Into<String>, category: DeviceCategory, priority: Option<u8>) -> Self {
        Self {
            id: id.into(),
            category,
            priority,
        }
    }
}

impl Device for LogDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> DeviceCategory {
        self.category
    }

    fn priority(&self) -> u8 {
        self.priority
            .unwrap_or_else(|| self.category.default_priority())
    }

    fn set_state(&self, state: DesiredState, params: &CommandParams) -> Result<(), CommandError> {
        log::info!(
            "device {} ({:?}) -> {} [session {}]",
            self.id,
            self.category,
            state.as_str(),
            params.session_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_priorities_order_lights_first() {
        let mut categories = vec![
            DeviceCategory::Notification,
            DeviceCategory::Switch,
            DeviceCategory::Light,
            DeviceCategory::Announcement,
        ];
        categories.sort_by_key(|c| std::cmp::Reverse(c.default_priority()));
        assert_eq!(
            categories,
            vec![
                DeviceCategory::Light,
                DeviceCategory::Switch,
                DeviceCategory::Announcement,
                DeviceCategory::Notification,
            ]
        );
    }

    #[test]
    fn log_device_honours_priority_override() {
        let device = LogDevice::new("porch", DeviceCategory::Notification, Some(99));
        assert_eq!(device.priority(), 99);
        assert!(device
            .set_state(DesiredState::On, &CommandParams::default())
            .is_ok());
    }
}
