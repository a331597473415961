//! Where telemetry goes. Publishing never blocks the pipeline: the MQTT sink
//! hands messages to its own thread through a bounded queue and drops (and
//! counts) whatever does not fit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{Context, Result};

use crate::transport::{MessagePublisher, Topics};

use super::messages::TelemetryMessage;

pub trait TelemetrySink: Send + Sync {
    fn publish(&self, message: TelemetryMessage);

    /// Messages lost to a full queue or a failed publish.
    fn dropped(&self) -> u64 {
        0
    }

    /// Deliver what is queued and stop accepting more.
    fn close(&self) {}
}

pub struct MqttSink {
    tx: Mutex<Option<SyncSender<TelemetryMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl MqttSink {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        topics: Topics,
        capacity: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let worker_dropped = Arc::clone(&dropped);
        let worker = std::thread::Builder::new()
            .name("telemetry".to_string())
            .spawn(move || drain(rx, publisher, topics, worker_dropped))
            .context("spawn telemetry thread")?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped,
        })
    }
}

fn drain(
    rx: Receiver<TelemetryMessage>,
    publisher: Arc<dyn MessagePublisher>,
    topics: Topics,
    dropped: Arc<AtomicU64>,
) {
    for message in rx {
        let topic = message.topic(&topics);
        let sent = message
            .to_json()
            .and_then(|payload| publisher.publish(&topic, payload, message.retain()));
        if let Err(err) = sent {
            dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("telemetry {} publish failed: {:#}", message.kind(), err);
        }
    }
}

impl TelemetrySink for MqttSink {
    fn publish(&self, message: TelemetryMessage) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("telemetry queue full, dropping {}", message.kind());
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::warn!("telemetry thread panicked");
            }
        }
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writes every message to the log. Used when MQTT is disabled.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn publish(&self, message: TelemetryMessage) {
        match message.to_json() {
            Ok(payload) => log::info!(
                "telemetry {}: {}",
                message.kind(),
                String::from_utf8_lossy(&payload)
            ),
            Err(err) => log::warn!("telemetry {} encode failed: {:#}", message.kind(), err),
        }
    }
}

/// Keeps messages in memory.
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<TelemetryMessage>>,
}

impl MemorySink {
    pub fn messages(&self) -> Vec<TelemetryMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<TelemetryMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.kind() == kind)
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn publish(&self, message: TelemetryMessage) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::messages::{MetricsMessage, SCHEMA_VERSION};
    use crate::telemetry::metrics::MetricsSnapshot;
    use crate::transport::RecordingPublisher;

    fn metrics_message() -> TelemetryMessage {
        TelemetryMessage::Metrics(MetricsMessage {
            schema_version: SCHEMA_VERSION,
            snapshot: MetricsSnapshot::default(),
            timestamp: 0.0,
        })
    }

    #[test]
    fn mqtt_sink_delivers_on_close() {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = MqttSink::new(publisher.clone(), Topics::new("sb"), 16).unwrap();
        sink.publish(metrics_message());
        sink.publish(metrics_message());
        sink.close();
        assert_eq!(publisher.topics(), vec!["sb/metrics", "sb/metrics"]);
        assert_eq!(sink.dropped(), 0);
        sink.publish(metrics_message());
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn failed_publishes_are_counted() {
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.fail_next("broker down");
        let sink = MqttSink::new(publisher.clone(), Topics::new("sb"), 4).unwrap();
        sink.publish(metrics_message());
        sink.publish(metrics_message());
        sink.close();
        assert_eq!(publisher.messages().len(), 1);
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn memory_sink_filters_by_kind() {
        let sink = MemorySink::default();
        sink.publish(metrics_message());
        assert_eq!(sink.of_kind("metrics").len(), 1);
        assert!(sink.of_kind("status").is_empty());
    }
}
