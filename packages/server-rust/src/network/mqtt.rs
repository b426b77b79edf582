//! MQTT transport backed by `rumqttc`.
//!
//! The client's event loop runs in its own task and is translated into
//! [`TransportEvent`]s. A connection error is reported once as
//! `Disconnected`; polling again makes `rumqttc` reconnect, with an
//! exponential backoff between attempts.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{ConnectOptions, ReconnectPolicy};
use super::transport::{EventReceiver, Transport, TransportError, TransportEvent};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// [`Transport`] over an MQTT broker.
#[derive(Default)]
pub struct MqttTransport {
    client: Mutex<Option<AsyncClient>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.client.lock().clone().ok_or(TransportError::NotConnected)
    }
}

fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_clean_session(true);
    if let Some((user, pass)) = options.credentials() {
        mqtt.set_credentials(user, pass);
    }
    mqtt
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<EventReceiver, TransportError> {
        let mut slot = self.client.lock();
        if slot.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options(options), options.outbound_capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, tx, options.reconnect));

        info!(host = %options.host, port = options.port, client_id = %options.client_id, "connecting to broker");
        *slot = Some(client);
        *self.driver.lock() = Some(driver);
        Ok(rx)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Client(e.into()))
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| TransportError::Client(e.into()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = self.client.lock().take();
        let driver = self.driver.lock().take();

        let result = match client {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| TransportError::Client(e.into())),
            None => Ok(()),
        };

        if let Some(mut driver) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                debug!("broker event loop did not finish, aborting");
                driver.abort();
            }
        }
        result
    }
}

/// Polls the client event loop until the session is closed or the server
/// stops listening.
async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    policy: ReconnectPolicy,
) {
    let mut connected = false;
    let mut delay = policy.min_delay;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected = true;
                delay = policy.min_delay;
                info!("broker session established");
                TransportEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(TransportEvent::Disconnected { reason: None });
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                if connected {
                    connected = false;
                    if events
                        .send(TransportEvent::Disconnected {
                            reason: Some(e.to_string()),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                warn!(error = %e, retry_in = ?delay, "broker connection error");
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
                continue;
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
    debug!("broker event loop finished");
}
