//! A library for connecting to FitTrack Bluetooth fitness trackers, and sending the activity they
//! detect to a cloud telemetry service.
//!
//! The Bluetooth stack and the cloud transport are supplied by the caller, by implementing
//! [`BleAdapter`] and [`TelemetryTransport`]. Start by creating an [`ActivityBridge`].

pub mod activity;
pub mod bridge;
#[cfg(test)]
mod fake;
pub mod telemetry;
pub mod tracker;
pub mod watcher;

pub use activity::{ActivityCode, DecodeError};
pub use bridge::{ActivityBridge, BridgeError, BridgeHandle};
pub use telemetry::{DispatchError, TelemetryDispatcher, TelemetryMessage, TelemetryTransport};
pub use tracker::{ActivityTracker, ConnectionStatus};
pub use watcher::{
    AdapterEvent, BleAdapter, ConnectError, PeripheralWatcher, ScanError, WatcherEvent,
    WatcherState,
};
use uuid::Uuid;

/// The name which FitTrack trackers advertise.
pub const FITTRACK_NAME: &str = "FitTrack";
/// The GATT service containing the activity characteristic.
pub const ACTIVITY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0d5b7c3c_c235_4b57_bde8_ce079704ce9b);
/// The characteristic holding the current activity as a single byte. It supports reads and
/// notifications.
pub const ACTIVITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbc9f3db2_01f0_4c35_a46c_12cc46611ed8);

/// An error from one of the external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
