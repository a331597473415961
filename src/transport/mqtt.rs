//! MQTT session: availability, command subscription and reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};

use crate::config::MqttSettings;
use crate::control::ControlCommand;

use super::tls::{parse_mqtt_endpoint, TlsMaterials};
use super::{MessagePublisher, Topics, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

/// Connected client plus the thread that drives its event loop.
///
/// The event loop reconnects on its own: after an error the thread waits
/// `reconnect_delay` and polls again. On every (re)connect it republishes
/// `online` and resubscribes to the command topics.
pub struct MqttLink {
    client: Client,
    topics: Topics,
    stopping: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    pub fn connect(
        settings: &MqttSettings,
        control: Option<Sender<ControlCommand>>,
    ) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker_addr)?;
        let tls = TlsMaterials::load(
            settings.ca_path.as_deref(),
            settings.client_cert_path.as_deref(),
            settings.client_key_path.as_deref(),
        )?;
        let topics = Topics::new(&settings.topic_prefix);

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        let will = LastWill::new(
            topics.availability(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);
        options.set_transport(tls.build_transport(&endpoint)?);

        let (client, connection) = Client::new(options, 64);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = {
            let client = client.clone();
            let topics = topics.clone();
            let stopping = Arc::clone(&stopping);
            let delay = settings.reconnect_delay;
            std::thread::Builder::new()
                .name("mqtt".to_string())
                .spawn(move || drive(connection, client, topics, control, stopping, delay))
                .context("failed to spawn MQTT thread")?
        };

        log::info!(
            "mqtt: connecting to {}:{} (tls: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            topics,
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Publish `offline`, disconnect and wait for the event loop to stop.
    /// Safe to call more than once.
    pub fn disconnect(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.client.publish(
            self.topics.availability(),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
        ) {
            log::warn!("mqtt: failed to queue offline status: {}", err);
        }
        self.client.disconnect().context("mqtt disconnect")?;
        let handle = self
            .connection_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl MessagePublisher for MqttLink {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .with_context(|| format!("mqtt publish to {}", topic))
    }
}

fn drive(
    mut connection: Connection,
    client: Client,
    topics: Topics,
    control: Option<Sender<ControlCommand>>,
    stopping: Arc<AtomicBool>,
    reconnect_delay: Duration,
) {
    for event in connection.iter() {
        if stopping.load(Ordering::SeqCst) && event.is_err() {
            break;
        }
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("mqtt: connected");
                // try_* only: this thread is the one draining the request queue.
                if let Err(err) = client.try_publish(
                    topics.availability(),
                    QoS::AtLeastOnce,
                    true,
                    PAYLOAD_ONLINE.as_bytes().to_vec(),
                ) {
                    log::warn!("mqtt: failed to queue online status: {}", err);
                }
                if control.is_some() {
                    let filter = topics.command_filter();
                    if let Err(err) = client.try_subscribe(filter, QoS::AtLeastOnce) {
                        log::warn!("mqtt: failed to subscribe to commands: {}", err);
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = match std::str::from_utf8(&publish.topic) {
                    Ok(topic) => topic,
                    Err(e) => {
                        log::warn!("mqtt: skipping publish with invalid topic: {}", e);
                        continue;
                    }
                };
                let (Some(tx), Some(cmd)) = (
                    control.as_ref(),
                    ControlCommand::from_topic(topics.prefix(), topic),
                ) else {
                    continue;
                };
                log::info!("mqtt: control command {:?}", cmd);
                if tx.send(cmd).is_err() {
                    log::debug!("mqtt: control receiver gone");
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "mqtt: connection error: {}; retrying in {:?}",
                    e,
                    reconnect_delay
                );
                std::thread::sleep(reconnect_delay);
            }
        }
    }
    log::info!("mqtt: event loop stopped");
}
