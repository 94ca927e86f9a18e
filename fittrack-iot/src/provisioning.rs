//! Registration with the Azure IoT Hub device provisioning service (DPS) over MQTT, to find out
//! which IoT Hub the device has been assigned to.

use crate::config::IotCentralConfig;
use crate::mqtt::{get_mqtt_options, REQUESTS_CAP};
use crate::sas::{generate_sas_token, SasError};
use rumqttc::{AsyncClient, ClientError, ConnectionError, Event, Incoming, QoS};
use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::sleep;

const DPS_API_VERSION: &str = "2019-03-31";
const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Sas(#[from] SasError),
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("{0}")]
    Connection(#[from] ConnectionError),
    #[error("Invalid registration response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("Unexpected publish on {0:?}")]
    UnexpectedTopic(String),
    #[error("Registration rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Registration ended with status {0:?}")]
    Failed(String),
    #[error("Registration assigned without a hub and device ID")]
    MissingAssignment,
}

/// The IoT Hub and device ID which the provisioning service assigned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Registration {
    pub assigned_hub: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequest<'a> {
    registration_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    operation_id: String,
    status: String,
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
}

/// The parts of a `$dps/registrations/res/<status>/?$rid=<id>&retry-after=<seconds>` topic.
#[derive(Debug, Eq, PartialEq)]
struct ResponseTopic {
    status: u16,
    request_id: Option<u32>,
    retry_after: Option<Duration>,
}

impl ResponseTopic {
    fn parse(topic: &str) -> Option<Self> {
        let (status, query) = topic.strip_prefix(RESPONSE_TOPIC_PREFIX)?.split_once("/?")?;
        let mut response = ResponseTopic {
            status: status.parse().ok()?,
            request_id: None,
            retry_after: None,
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "$rid" => response.request_id = value.parse().ok(),
                "retry-after" => response.retry_after = value.parse().ok().map(Duration::from_secs),
                _ => {}
            }
        }
        Some(response)
    }
}

fn register_topic(request_id: u32) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={}", request_id)
}

fn operation_status_topic(request_id: u32, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
        request_id, operation_id
    )
}

impl RegistrationOperation {
    /// Convert a response to the assigned hub, if it has been assigned yet.
    fn into_registration(self) -> Result<Option<Registration>, ProvisioningError> {
        match self.status.as_str() {
            "assigning" => Ok(None),
            "assigned" => match self.registration_state {
                Some(RegistrationState {
                    assigned_hub: Some(assigned_hub),
                    device_id: Some(device_id),
                }) => Ok(Some(Registration {
                    assigned_hub,
                    device_id,
                })),
                _ => Err(ProvisioningError::MissingAssignment),
            },
            _ => Err(ProvisioningError::Failed(self.status)),
        }
    }
}

/// Register the configured device with the provisioning service, and wait until it has been
/// assigned to an IoT Hub.
pub async fn register(config: &IotCentralConfig) -> Result<Registration, ProvisioningError> {
    let resource_uri = format!("{}/registrations/{}", config.id_scope, config.device_id);
    let sas_token = generate_sas_token(
        &resource_uri,
        &config.key,
        SystemTime::now() + config.token_ttl,
    )?;
    let mqtt_options = get_mqtt_options(
        &config.device_id,
        &config.provisioning_host,
        format!("{}/api-version={}", resource_uri, DPS_API_VERSION),
        sas_token,
    );
    let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUESTS_CAP);

    client
        .subscribe(format!("{}#", RESPONSE_TOPIC_PREFIX), QoS::AtLeastOnce)
        .await?;
    let mut request_id = 1;
    let request = RegistrationRequest {
        registration_id: &config.device_id,
    };
    client
        .publish(
            register_topic(request_id),
            QoS::AtLeastOnce,
            false,
            serde_json::to_vec(&request)?,
        )
        .await?;

    loop {
        let publish = match event_loop.poll().await? {
            Event::Incoming(Incoming::Publish(publish)) => publish,
            notification => {
                log::trace!("Notification = {:?}", notification);
                continue;
            }
        };
        let response = ResponseTopic::parse(&publish.topic)
            .ok_or_else(|| ProvisioningError::UnexpectedTopic(publish.topic.clone()))?;
        if response.request_id != Some(request_id) {
            log::debug!("Ignoring response to old request: {:?}", response);
            continue;
        }
        if response.status >= 300 {
            return Err(ProvisioningError::Rejected {
                status: response.status,
                body: String::from_utf8_lossy(&publish.payload).into_owned(),
            });
        }

        let operation: RegistrationOperation = serde_json::from_slice(&publish.payload)?;
        log::debug!(
            "Registration operation {} is {}",
            operation.operation_id,
            operation.status
        );
        let operation_id = operation.operation_id.clone();
        if let Some(registration) = operation.into_registration()? {
            if let Err(e) = client.disconnect().await {
                log::debug!("Error disconnecting from provisioning service: {}", e);
            }
            return Ok(registration);
        }

        sleep(response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER)).await;
        request_id += 1;
        client
            .publish(
                operation_status_topic(request_id, &operation_id),
                QoS::AtLeastOnce,
                false,
                Vec::new(),
            )
            .await?;
    }
}
