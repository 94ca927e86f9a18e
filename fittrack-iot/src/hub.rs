//! Sending telemetry to an Azure IoT Hub over MQTT.

use crate::mqtt::{get_mqtt_options, REQUESTS_CAP};
use crate::sas::{generate_sas_token, url_encode, SasError};
use async_trait::async_trait;
use fittrack::{BoxError, TelemetryMessage, TelemetryTransport};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task;
use tokio::time::{sleep, timeout_at, Instant};

const HUB_API_VERSION: &str = "2021-04-12";
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Sas(#[from] SasError),
    #[error("Error connecting to IoT Hub: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Not connected to IoT Hub")]
    NotConnected,
}

/// What's needed to authenticate to the hub as the device.
#[derive(Clone, Debug)]
struct Credentials {
    hub: String,
    device_id: String,
    key: String,
    token_ttl: Duration,
}

impl Credentials {
    fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.hub, self.device_id, HUB_API_VERSION
        )
    }

    /// Generate a new SAS token, valid from now for `token_ttl`.
    fn sas_token(&self) -> Result<String, SasError> {
        generate_sas_token(
            &format!("{}/devices/{}", self.hub, self.device_id),
            &self.key,
            SystemTime::now() + self.token_ttl,
        )
    }

    /// When a token generated now should be replaced, a while before it expires.
    fn refresh_deadline(&self) -> Instant {
        Instant::now() + self.token_ttl - self.token_ttl / 5
    }
}

/// A connection to an IoT Hub as a single device.
#[derive(Clone, Debug)]
pub struct IotHubClient {
    client: AsyncClient,
    device_id: String,
    /// Whether the MQTT connection is currently up, as last seen by the event loop task.
    connected: Arc<AtomicBool>,
}

impl IotHubClient {
    /// Connect to the given IoT Hub, and wait until the connection is acknowledged.
    ///
    /// A task is spawned to keep polling the MQTT connection, which reconnects if the connection
    /// is lost and renews the SAS token before it expires.
    pub async fn connect(
        hub: &str,
        device_id: &str,
        key: &str,
        token_ttl: Duration,
    ) -> Result<Self, HubError> {
        let credentials = Credentials {
            hub: hub.to_owned(),
            device_id: device_id.to_owned(),
            key: key.to_owned(),
            token_ttl,
        };
        let mqtt_options = get_mqtt_options(
            device_id,
            hub,
            credentials.username(),
            credentials.sas_token()?,
        );
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUESTS_CAP);

        loop {
            let notification = event_loop.poll().await?;
            log::trace!("Notification = {:?}", notification);
            if let Event::Incoming(Incoming::ConnAck(_)) = notification {
                break;
            }
        }
        log::info!("Connected to IoT Hub {} as {}", hub, device_id);
        let connected = Arc::new(AtomicBool::new(true));
        task::spawn(poll_event_loop(event_loop, credentials, connected.clone()));

        Ok(Self {
            client,
            device_id: device_id.to_owned(),
            connected,
        })
    }
}

/// Put a fresh SAS token into the event loop's options, to be used the next time it connects.
/// Returns when it should next be refreshed.
fn refresh_credentials(event_loop: &mut EventLoop, credentials: &Credentials) -> Instant {
    match credentials.sas_token() {
        Ok(sas_token) => {
            event_loop
                .mqtt_options
                .set_credentials(credentials.username(), sas_token);
        }
        Err(e) => log::error!("Failed to generate IoT Hub SAS token: {}", e),
    }
    credentials.refresh_deadline()
}

async fn poll_event_loop(
    mut event_loop: EventLoop,
    credentials: Credentials,
    connected: Arc<AtomicBool>,
) {
    let mut refresh_at = credentials.refresh_deadline();
    loop {
        match timeout_at(refresh_at, event_loop.poll()).await {
            Err(_) => {
                log::info!("Renewing IoT Hub SAS token");
                refresh_at = refresh_credentials(&mut event_loop, &credentials);
                // Drop the connection, so that it is made again with the new token.
                connected.store(false, Ordering::SeqCst);
                event_loop.clean();
            }
            Ok(Ok(Event::Incoming(Incoming::ConnAck(connack)))) => {
                log::info!("Reconnected to IoT Hub: {:?}", connack.code);
                connected.store(true, Ordering::SeqCst);
            }
            Ok(Ok(notification)) => log::trace!("Notification = {:?}", notification),
            Ok(Err(ConnectionError::RequestsDone)) => {
                log::debug!("IoT Hub client dropped");
                break;
            }
            Ok(Err(e)) => {
                connected.store(false, Ordering::SeqCst);
                log::error!("IoT Hub connection error: {}", e);
                if Instant::now() >= refresh_at {
                    refresh_at = refresh_credentials(&mut event_loop, &credentials);
                }
                sleep(RECONNECT_INTERVAL).await;
            }
        }
    }
}

/// The topic on which to publish a device-to-cloud message, with its content type and encoding as
/// system properties.
fn telemetry_topic(device_id: &str, message: &TelemetryMessage) -> String {
    format!(
        "devices/{}/messages/events/$.ct={}&$.ce={}",
        device_id,
        url_encode(message.content_type),
        url_encode(message.content_encoding)
    )
}

#[async_trait]
impl TelemetryTransport for IotHubClient {
    /// Queue the message to be published. This fails straight away if the hub is disconnected or
    /// the queue is full, rather than waiting for the connection to come back.
    async fn send_event(&self, message: TelemetryMessage) -> Result<(), BoxError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HubError::NotConnected.into());
        }
        let topic = telemetry_topic(&self.device_id, &message);
        log::trace!("Publishing {:?} to {}", message.payload, topic);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, message.payload)?;
        Ok(())
    }
}
