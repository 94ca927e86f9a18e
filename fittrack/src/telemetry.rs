use crate::activity::ActivityCode;
use crate::tracker::ConnectionStatus;
use crate::BoxError;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

pub const CONTENT_TYPE: &str = "application/json";
pub const CONTENT_ENCODING: &str = "utf-8";
/// How long to wait for the transport to accept a message before giving up on it.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// An error sending telemetry to the cloud.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Error serialising telemetry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Error sending telemetry: {0}")]
    Transport(#[source] BoxError),
    #[error("Timed out sending telemetry")]
    Timeout,
}

/// The body of a telemetry message.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
struct ActivityTelemetry {
    #[serde(rename = "CurrentActivity")]
    current_activity: ActivityCode,
}

/// Serialise the given activity to the JSON telemetry payload, `{"CurrentActivity":"<name>"}`.
pub fn to_payload(code: ActivityCode) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&ActivityTelemetry {
        current_activity: code,
    })
}

/// Parse a telemetry payload produced by `to_payload`.
pub fn from_payload(payload: &[u8]) -> Result<ActivityCode, serde_json::Error> {
    let telemetry: ActivityTelemetry = serde_json::from_slice(payload)?;
    Ok(telemetry.current_activity)
}

/// A serialised telemetry message, along with the metadata the transport needs to deliver it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TelemetryMessage {
    pub payload: Vec<u8>,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

impl TelemetryMessage {
    pub fn new(code: ActivityCode) -> Result<Self, serde_json::Error> {
        Ok(Self {
            payload: to_payload(code)?,
            content_type: CONTENT_TYPE,
            content_encoding: CONTENT_ENCODING,
        })
    }
}

/// An authenticated session with the cloud telemetry service.
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    /// Deliver a single telemetry message. Any retrying is up to the implementation.
    async fn send_event(&self, message: TelemetryMessage) -> Result<(), BoxError>;
}

/// Sends activity changes to the cloud once a session has been established.
#[derive(Debug)]
pub struct TelemetryDispatcher<T> {
    session: Option<T>,
    status: ConnectionStatus,
}

impl<T> Default for TelemetryDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TelemetryDispatcher<T> {
    pub fn new() -> Self {
        Self {
            session: None,
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Record that a session is being established in the background.
    pub fn mark_connecting(&mut self) {
        if self.session.is_none() {
            self.status = ConnectionStatus::Connecting;
        }
    }

    /// Record that establishing a session failed. Telemetry will keep being dropped.
    pub fn mark_failed(&mut self) {
        if self.session.is_none() {
            self.status = ConnectionStatus::Disconnected;
        }
    }

    /// Store the session returned by the cloud collaborator. From now on, `send` will deliver
    /// messages through it.
    pub fn establish_session(&mut self, session: T) {
        self.session = Some(session);
        self.status = ConnectionStatus::Connected;
    }
}

impl<T: TelemetryTransport> TelemetryDispatcher<T> {
    /// Send the given activity as a telemetry message.
    ///
    /// If no session has been established yet then the activity is dropped and this returns
    /// `Ok(())`. Transport errors are returned but not retried. A transport which doesn't accept
    /// the message within `SEND_TIMEOUT` is treated as having failed.
    pub async fn send(&self, code: ActivityCode) -> Result<(), DispatchError> {
        let session = match &self.session {
            Some(session) => session,
            None => {
                log::debug!("No cloud session yet, not sending activity {}", code);
                return Ok(());
            }
        };
        let message = TelemetryMessage::new(code)?;
        log::trace!(
            "Sending telemetry {:?}",
            String::from_utf8_lossy(&message.payload)
        );
        timeout(SEND_TIMEOUT, session.send_event(message))
            .await
            .map_err(|_| DispatchError::Timeout)?
            .map_err(DispatchError::Transport)
    }
}
