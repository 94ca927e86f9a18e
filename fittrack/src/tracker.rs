use crate::activity::ActivityCode;
use std::fmt::{self, Display, Formatter};

/// The state of a connection, either the Bluetooth link to the tracker or the session with the
/// cloud telemetry service.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    Connected,
}

impl ConnectionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keeps track of the last activity reported by the tracker, and decides which readings are
/// changes worth sending on.
#[derive(Clone, Debug)]
pub struct ActivityTracker {
    /// The last activity accepted by `observe`, or `None` if nothing has been observed since the
    /// last connection.
    current: Option<ActivityCode>,
    connection_status: ConnectionStatus,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            current: None,
            connection_status: ConnectionStatus::Disconnected,
        }
    }

    /// The last activity which was accepted as a change, if any.
    pub fn current(&self) -> Option<ActivityCode> {
        self.current
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    /// Compare a newly decoded activity against the current one.
    ///
    /// Returns the new activity if it is different, in which case it becomes the current activity.
    /// Returns `None` if it is the same, and nothing should be sent.
    pub fn observe(&mut self, code: ActivityCode) -> Option<ActivityCode> {
        if self.current == Some(code) {
            log::debug!("Activity unchanged: {}", code);
            None
        } else {
            log::info!(
                "Activity changed from {} to {}",
                self.current.map_or("unset", |c| c.as_str()),
                code
            );
            self.current = Some(code);
            Some(code)
        }
    }

    pub fn mark_connecting(&mut self) {
        self.connection_status = ConnectionStatus::Connecting;
    }

    /// Record a new connection to the tracker. The current activity is forgotten, so that the
    /// initial read after connecting is always treated as a change.
    pub fn mark_connected(&mut self) {
        self.current = None;
        self.connection_status = ConnectionStatus::Connected;
    }

    pub fn mark_disconnected(&mut self) {
        self.connection_status = ConnectionStatus::Disconnected;
    }
}
