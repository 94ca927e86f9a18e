//! Implementation of the Bluetooth adapter interface on top of BlueZ.

use async_trait::async_trait;
use bluez_async::{
    BluetoothError, BluetoothEvent, BluetoothSession, CharacteristicEvent, CharacteristicId,
    DeviceEvent, DeviceId, DeviceInfo, ServiceId,
};
use fittrack::{AdapterEvent, BleAdapter};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;
use uuid::Uuid;

pub type BluezEvent = AdapterEvent<DeviceId, CharacteristicId>;

#[derive(Clone, Debug)]
pub struct BluezAdapter {
    session: BluetoothSession,
}

impl BluezAdapter {
    pub fn new(session: BluetoothSession) -> Self {
        Self { session }
    }

    /// Get a stream of adapter events.
    ///
    /// BlueZ doesn't signal every advertisement, so while scanning the list of known devices is
    /// also polled every `scan_interval`, and each one is reported as discovered.
    pub async fn event_stream(
        &self,
        scan_interval: Duration,
    ) -> Result<Pin<Box<dyn Stream<Item = BluezEvent>>>, BluetoothError> {
        let signals = self
            .session
            .event_stream()
            .await?
            .filter_map(|event| async move { adapter_event(event) });

        let session = self.session.clone();
        let polled = IntervalStream::new(interval(scan_interval))
            .then(move |_| {
                let session = session.clone();
                async move {
                    match session.get_devices().await {
                        Ok(devices) => devices,
                        Err(e) => {
                            log::warn!("Failed to list Bluetooth devices: {}", e);
                            vec![]
                        }
                    }
                }
            })
            .flat_map(|devices| stream::iter(devices.into_iter().map(discovered)));

        Ok(Box::pin(stream::select(signals, polled)))
    }
}

fn discovered(device: DeviceInfo) -> BluezEvent {
    AdapterEvent::Discovered {
        id: device.id,
        name: device.name,
    }
}

/// Convert a BlueZ event to the events which the watcher cares about, if it is one.
fn adapter_event(event: BluetoothEvent) -> Option<BluezEvent> {
    match event {
        BluetoothEvent::Device {
            id,
            event: DeviceEvent::Connected { connected: false },
        } => Some(AdapterEvent::Disconnected { id }),
        BluetoothEvent::Characteristic {
            id,
            event: CharacteristicEvent::Value { value },
        } => Some(AdapterEvent::Value { id, value }),
        _ => None,
    }
}

#[async_trait]
impl BleAdapter for BluezAdapter {
    type PeripheralId = DeviceId;
    type ServiceId = ServiceId;
    type CharacteristicId = CharacteristicId;
    type Error = BluetoothError;

    async fn start_scan(&self) -> Result<(), BluetoothError> {
        self.session.start_discovery().await
    }

    async fn stop_scan(&self) -> Result<(), BluetoothError> {
        self.session.stop_discovery().await
    }

    async fn connect(&self, peripheral: &DeviceId) -> Result<(), BluetoothError> {
        self.session.connect(peripheral).await
    }

    async fn disconnect(&self, peripheral: &DeviceId) -> Result<(), BluetoothError> {
        self.session.disconnect(peripheral).await
    }

    async fn get_service(
        &self,
        peripheral: &DeviceId,
        uuid: Uuid,
    ) -> Result<ServiceId, BluetoothError> {
        Ok(self.session.get_service_by_uuid(peripheral, uuid).await?.id)
    }

    async fn get_characteristic(
        &self,
        service: &ServiceId,
        uuid: Uuid,
    ) -> Result<CharacteristicId, BluetoothError> {
        Ok(self
            .session
            .get_characteristic_by_uuid(service, uuid)
            .await?
            .id)
    }

    async fn read(&self, characteristic: &CharacteristicId) -> Result<Vec<u8>, BluetoothError> {
        self.session.read_characteristic_value(characteristic).await
    }

    async fn subscribe(&self, characteristic: &CharacteristicId) -> Result<(), BluetoothError> {
        self.session.start_notify(characteristic).await
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicId) -> Result<(), BluetoothError> {
        self.session.stop_notify(characteristic).await
    }
}
