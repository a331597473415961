//! Outbound/inbound messaging.
//!
//! `MessagePublisher` is the one seam devices and telemetry publish through;
//! `MqttLink` is the production implementation.

mod mqtt;
mod tls;

use std::sync::Mutex;

use anyhow::{anyhow, Result};

pub use mqtt::MqttLink;
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Fire-and-forget publish at QoS 1.
pub trait MessagePublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;
}

/// Topic layout under the configured prefix.
#[derive(Clone, Debug)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn detection(&self) -> String {
        format!("{}/detection", self.prefix)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn metrics(&self) -> String {
        format!("{}/metrics", self.prefix)
    }

    pub fn session(&self) -> String {
        format!("{}/session", self.prefix)
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.prefix)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/command/+", self.prefix)
    }
}

/// Keeps every publish in memory. Used by tests and `--no-mqtt` dry runs.
#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(String, Vec<u8>, bool)>>,
    fail_next: Mutex<Option<String>>,
}

impl RecordingPublisher {
    /// Make the next publish fail with `reason`.
    pub fn fail_next(&self, reason: &str) {
        if let Ok(mut guard) = self.fail_next.lock() {
            *guard = Some(reason.to_string());
        }
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .map(|(topic, payload, _)| (topic.clone(), payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages().into_iter().map(|(topic, _)| topic).collect()
    }

    pub fn retained(&self, topic: &str) -> bool {
        self.sent
            .lock()
            .map(|sent| sent.iter().any(|(t, _, retain)| t == topic && *retain))
            .unwrap_or(false)
    }
}

impl MessagePublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if let Some(reason) = self.fail_next.lock().ok().and_then(|mut g| g.take()) {
            return Err(anyhow!("{}", reason));
        }
        self.sent
            .lock()
            .map_err(|_| anyhow!("recording publisher poisoned"))?
            .push((topic.to_string(), payload, retain));
        Ok(())
    }
}
