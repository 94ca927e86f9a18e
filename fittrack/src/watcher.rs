use crate::{BoxError, ACTIVITY_CHARACTERISTIC_UUID, ACTIVITY_SERVICE_UUID};
use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;
use uuid::Uuid;

/// An error connecting to a tracker and subscribing to its activity characteristic. These are
/// recovered from by going back to scanning.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Error connecting: {0}")]
    Connect(#[source] BoxError),
    #[error("Service {uuid} not found: {source}")]
    ServiceNotFound {
        uuid: Uuid,
        #[source]
        source: BoxError,
    },
    #[error("Characteristic {uuid} not found: {source}")]
    CharacteristicNotFound {
        uuid: Uuid,
        #[source]
        source: BoxError,
    },
    #[error("Error reading initial value: {0}")]
    Read(#[source] BoxError),
    #[error("Error starting notifications: {0}")]
    Subscribe(#[source] BoxError),
}

/// An error starting discovery on the Bluetooth adapter.
#[derive(Debug, Error)]
#[error("Error starting discovery: {0}")]
pub struct ScanError(#[source] pub BoxError);

/// The subset of a Bluetooth adapter's GATT client functionality which the watcher needs.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    type PeripheralId: Clone + Debug + Eq + Send + Sync;
    type ServiceId: Clone + Debug + Send + Sync;
    type CharacteristicId: Clone + Debug + Eq + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start_scan(&self) -> Result<(), Self::Error>;

    async fn stop_scan(&self) -> Result<(), Self::Error>;

    async fn connect(&self, peripheral: &Self::PeripheralId) -> Result<(), Self::Error>;

    async fn disconnect(&self, peripheral: &Self::PeripheralId) -> Result<(), Self::Error>;

    /// Find the service with the given UUID on a connected peripheral.
    async fn get_service(
        &self,
        peripheral: &Self::PeripheralId,
        uuid: Uuid,
    ) -> Result<Self::ServiceId, Self::Error>;

    /// Find the characteristic with the given UUID within a service.
    async fn get_characteristic(
        &self,
        service: &Self::ServiceId,
        uuid: Uuid,
    ) -> Result<Self::CharacteristicId, Self::Error>;

    async fn read(&self, characteristic: &Self::CharacteristicId) -> Result<Vec<u8>, Self::Error>;

    /// Start notifications for the characteristic. They are delivered as `AdapterEvent::Value`.
    async fn subscribe(&self, characteristic: &Self::CharacteristicId) -> Result<(), Self::Error>;

    async fn unsubscribe(&self, characteristic: &Self::CharacteristicId)
        -> Result<(), Self::Error>;
}

/// An event reported by the Bluetooth adapter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdapterEvent<P, C> {
    /// A peripheral was seen while scanning.
    Discovered { id: P, name: Option<String> },
    /// The link to a peripheral was lost or closed.
    Disconnected { id: P },
    /// A subscribed characteristic changed value.
    Value { id: C, value: Vec<u8> },
}

/// An event reported by the watcher to its owner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatcherEvent<P> {
    Connecting(P),
    /// The tracker is connected and subscribed. This is always followed by a `CharacteristicValue`
    /// event with the initial value.
    Connected(P),
    Disconnected,
    CharacteristicValue(Vec<u8>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatcherState<P, C> {
    Idle,
    Scanning,
    Connecting { peripheral: P },
    Connected { peripheral: P, characteristic: C },
    Disconnected,
}

/// Scans for a tracker with a given name, connects to it, and reports the values of its activity
/// characteristic.
#[derive(Debug)]
pub struct PeripheralWatcher<A: BleAdapter> {
    adapter: A,
    peripheral_name: String,
    state: WatcherState<A::PeripheralId, A::CharacteristicId>,
}

impl<A: BleAdapter> PeripheralWatcher<A> {
    pub fn new(adapter: A, peripheral_name: &str) -> Self {
        Self {
            adapter,
            peripheral_name: peripheral_name.to_owned(),
            state: WatcherState::Idle,
        }
    }

    pub fn state(&self) -> &WatcherState<A::PeripheralId, A::CharacteristicId> {
        &self.state
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Start scanning for the tracker, unless the watcher is already scanning or connected.
    pub async fn start_scan(&mut self) -> Result<(), ScanError> {
        match self.state {
            WatcherState::Idle | WatcherState::Disconnected => {
                self.adapter
                    .start_scan()
                    .await
                    .map_err(|e| ScanError(e.into()))?;
                log::info!("Scanning for {}", self.peripheral_name);
                self.state = WatcherState::Scanning;
            }
            WatcherState::Scanning
            | WatcherState::Connecting { .. }
            | WatcherState::Connected { .. } => {
                log::debug!("Not starting scan from state {:?}", self.state);
            }
        }
        Ok(())
    }

    /// Go back to scanning after losing the tracker. If discovery can't be restarted then the
    /// watcher stays `Disconnected`, and it is tried again on the next adapter event.
    async fn resume_scan(&mut self) {
        if let Err(e) = self.start_scan().await {
            log::warn!("{}, will retry", e);
        }
    }

    /// Act on an event from the adapter, and return the events which result from it.
    pub async fn handle_event(
        &mut self,
        event: AdapterEvent<A::PeripheralId, A::CharacteristicId>,
    ) -> Vec<WatcherEvent<A::PeripheralId>> {
        if self.state == WatcherState::Disconnected {
            self.resume_scan().await;
        }
        match event {
            AdapterEvent::Discovered { id, name } => {
                if self.state != WatcherState::Scanning {
                    log::trace!("Ignoring discovery of {:?} while not scanning", id);
                    vec![]
                } else if name.as_deref() != Some(self.peripheral_name.as_str()) {
                    log::trace!("Ignoring {:?} ({:?})", id, name);
                    vec![]
                } else {
                    self.connect(id).await
                }
            }
            AdapterEvent::Disconnected { id } => match &self.state {
                WatcherState::Connecting { peripheral }
                | WatcherState::Connected { peripheral, .. }
                    if *peripheral == id =>
                {
                    log::info!("{:?} disconnected", id);
                    self.state = WatcherState::Disconnected;
                    self.resume_scan().await;
                    vec![WatcherEvent::Disconnected]
                }
                _ => {
                    log::trace!("{:?} disconnected but wasn't connected", id);
                    vec![]
                }
            },
            AdapterEvent::Value { id, value } => match &self.state {
                WatcherState::Connected { characteristic, .. } if *characteristic == id => {
                    vec![WatcherEvent::CharacteristicValue(value)]
                }
                _ => {
                    log::trace!("Ignoring value {:?} from {:?}", value, id);
                    vec![]
                }
            },
        }
    }

    async fn connect(
        &mut self,
        peripheral: A::PeripheralId,
    ) -> Vec<WatcherEvent<A::PeripheralId>> {
        log::info!("Found {} as {:?}, connecting", self.peripheral_name, peripheral);
        let mut events = vec![WatcherEvent::Connecting(peripheral.clone())];
        self.state = WatcherState::Connecting {
            peripheral: peripheral.clone(),
        };
        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("Error stopping discovery: {}", e);
        }

        match self.connect_and_subscribe_or_disconnect(&peripheral).await {
            Ok((characteristic, value)) => {
                log::info!("Connected to {:?} and started notifications", peripheral);
                self.state = WatcherState::Connected {
                    peripheral: peripheral.clone(),
                    characteristic,
                };
                events.push(WatcherEvent::Connected(peripheral));
                events.push(WatcherEvent::CharacteristicValue(value));
            }
            Err(e) => {
                log::warn!("Failed to connect to {:?}: {}", peripheral, e);
                self.state = WatcherState::Disconnected;
                events.push(WatcherEvent::Disconnected);
                self.resume_scan().await;
            }
        }
        events
    }

    async fn connect_and_subscribe_or_disconnect(
        &self,
        peripheral: &A::PeripheralId,
    ) -> Result<(A::CharacteristicId, Vec<u8>), ConnectError> {
        self.adapter
            .connect(peripheral)
            .await
            .map_err(|e| ConnectError::Connect(e.into()))?;

        let result = self.subscribe(peripheral).await;
        if result.is_err() {
            if let Err(e) = self.adapter.disconnect(peripheral).await {
                log::warn!("Error disconnecting from {:?}: {}", peripheral, e);
            }
        }
        result
    }

    /// Resolve the activity characteristic, read its current value, then start notifications.
    async fn subscribe(
        &self,
        peripheral: &A::PeripheralId,
    ) -> Result<(A::CharacteristicId, Vec<u8>), ConnectError> {
        let service = self
            .adapter
            .get_service(peripheral, ACTIVITY_SERVICE_UUID)
            .await
            .map_err(|e| ConnectError::ServiceNotFound {
                uuid: ACTIVITY_SERVICE_UUID,
                source: e.into(),
            })?;
        let characteristic = self
            .adapter
            .get_characteristic(&service, ACTIVITY_CHARACTERISTIC_UUID)
            .await
            .map_err(|e| ConnectError::CharacteristicNotFound {
                uuid: ACTIVITY_CHARACTERISTIC_UUID,
                source: e.into(),
            })?;
        let value = self
            .adapter
            .read(&characteristic)
            .await
            .map_err(|e| ConnectError::Read(e.into()))?;
        self.adapter
            .subscribe(&characteristic)
            .await
            .map_err(|e| ConnectError::Subscribe(e.into()))?;
        Ok((characteristic, value))
    }

    /// Stop notifications, disconnect and stop scanning, as appropriate for the current state.
    /// Errors are logged rather than returned, so this is always safe to call.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, WatcherState::Idle) {
            WatcherState::Connected {
                peripheral,
                characteristic,
            } => {
                if let Err(e) = self.adapter.unsubscribe(&characteristic).await {
                    log::warn!("Error stopping notifications on {:?}: {}", characteristic, e);
                }
                if let Err(e) = self.adapter.disconnect(&peripheral).await {
                    log::warn!("Error disconnecting from {:?}: {}", peripheral, e);
                }
            }
            WatcherState::Connecting { peripheral } => {
                if let Err(e) = self.adapter.disconnect(&peripheral).await {
                    log::warn!("Error disconnecting from {:?}: {}", peripheral, e);
                }
            }
            WatcherState::Scanning => {
                if let Err(e) = self.adapter.stop_scan().await {
                    log::warn!("Error stopping discovery: {}", e);
                }
            }
            WatcherState::Idle | WatcherState::Disconnected => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeAdapter;

    const TRACKER: &str = "hci0/dev_tracker";

    fn discovered(id: &str, name: &str) -> AdapterEvent<String, String> {
        AdapterEvent::Discovered {
            id: id.to_owned(),
            name: Some(name.to_owned()),
        }
    }

    async fn scanning_watcher(adapter: &FakeAdapter) -> PeripheralWatcher<FakeAdapter> {
        let mut watcher = PeripheralWatcher::new(adapter.clone(), "FitTrack");
        watcher.start_scan().await.unwrap();
        watcher
    }

    #[tokio::test]
    async fn start_scan_is_idempotent() {
        let adapter = FakeAdapter::with_value(&[0]);
        let mut watcher = scanning_watcher(&adapter).await;
        watcher.start_scan().await.unwrap();
        assert_eq!(watcher.state(), &WatcherState::Scanning);
        assert_eq!(adapter.calls(), vec!["start_scan"]);
    }

    #[tokio::test]
    async fn start_scan_failure() {
        let adapter = FakeAdapter::with_value(&[0]);
        adapter.fail_scan();
        let mut watcher = PeripheralWatcher::new(adapter.clone(), "FitTrack");
        assert!(watcher.start_scan().await.is_err());
        assert_eq!(watcher.state(), &WatcherState::Idle);
    }

    #[tokio::test]
    async fn ignores_other_names() {
        let adapter = FakeAdapter::with_value(&[2]);
        let mut watcher = scanning_watcher(&adapter).await;

        let events = watcher.handle_event(discovered("hci0/dev_other", "OtherDevice")).await;
        assert_eq!(events, vec![]);
        let events = watcher
            .handle_event(AdapterEvent::Discovered {
                id: "hci0/dev_unnamed".to_owned(),
                name: None,
            })
            .await;
        assert_eq!(events, vec![]);
        assert_eq!(watcher.state(), &WatcherState::Scanning);
        assert_eq!(adapter.calls(), vec!["start_scan"]);
    }

    #[tokio::test]
    async fn ignores_discovery_when_idle() {
        let adapter = FakeAdapter::with_value(&[2]);
        let mut watcher = PeripheralWatcher::new(adapter.clone(), "FitTrack");
        let events = watcher.handle_event(discovered(TRACKER, "FitTrack")).await;
        assert_eq!(events, vec![]);
        assert_eq!(adapter.calls(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn connects_reads_then_subscribes() {
        let adapter = FakeAdapter::with_value(&[2]);
        let mut watcher = scanning_watcher(&adapter).await;

        let events = watcher.handle_event(discovered(TRACKER, "FitTrack")).await;
        assert_eq!(
            events,
            vec![
                WatcherEvent::Connecting(TRACKER.to_owned()),
                WatcherEvent::Connected(TRACKER.to_owned()),
                WatcherEvent::CharacteristicValue(vec![2]),
            ]
        );
        assert_eq!(
            watcher.state(),
            &WatcherState::Connected {
                peripheral: TRACKER.to_owned(),
                characteristic: FakeAdapter::characteristic_id(TRACKER),
            }
        );
        assert_eq!(
            adapter.calls(),
            vec![
                "start_scan".to_owned(),
                "stop_scan".to_owned(),
                format!("connect {}", TRACKER),
                format!("get_service {}", ACTIVITY_SERVICE_UUID),
                format!("get_characteristic {}", ACTIVITY_CHARACTERISTIC_UUID),
                format!("read {}", FakeAdapter::characteristic_id(TRACKER)),
                format!("subscribe {}", FakeAdapter::characteristic_id(TRACKER)),
            ]
        );

        // A second tracker with the same name is ignored while connected.
        let events = watcher.handle_event(discovered("hci0/dev_second", "FitTrack")).await;
        assert_eq!(events, vec![]);
    }

    #[tokio::test]
    async fn connect_failure_resumes_scanning() {
        let adapter = FakeAdapter::with_value(&[2]);
        adapter.fail_connect();
        let mut watcher = scanning_watcher(&adapter).await;

        let events = watcher.handle_event(discovered(TRACKER, "FitTrack")).await;
        assert_eq!(
            events,
            vec![
                WatcherEvent::Connecting(TRACKER.to_owned()),
                WatcherEvent::Disconnected,
            ]
        );
        assert_eq!(watcher.state(), &WatcherState::Scanning);
        assert_eq!(
            adapter.calls(),
            vec![
                "start_scan".to_owned(),
                "stop_scan".to_owned(),
                format!("connect {}", TRACKER),
                "start_scan".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_rescan_is_retried() {
        let adapter = FakeAdapter::with_value(&[2]);
        adapter.fail_next_connect();
        let mut watcher = scanning_watcher(&adapter).await;

        adapter.fail_next_scan();
        let events = watcher.handle_event(discovered(TRACKER, "FitTrack")).await;
        assert_eq!(
            events,
            vec![
                WatcherEvent::Connecting(TRACKER.to_owned()),
                WatcherEvent::Disconnected,
            ]
        );
        assert_eq!(watcher.state(), &WatcherState::Disconnected);

        // The next discovery restarts the scan, and is then acted on.
        let events = watcher.handle_event(discovered(TRACKER, "FitTrack")).await;
        assert_eq!(events.last(), Some(&WatcherEvent::CharacteristicValue(vec![2])));
        assert!(matches!(watcher.state(), WatcherState::Connected { .. }));
        let calls = adapter.calls();
        assert_eq!(
            calls[..5],
            [
                "start_scan".to_owned(),
                "stop_scan".to_owned(),
                format!("connect {}", TRACKER),
                "start_scan".to_owned(),
                "start_scan".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_rescan_after_link_loss() {
        let adapter = FakeAdapter::with_value(&[0]);
        let mut watcher = scanning_watcher(&adapter).await;
        watcher.handle_event(discovered(TRACKER, "FitTrack")).await;

        adapter.fail_next_scan();
        let events = watcher
            .handle_event(AdapterEvent::Disconnected {
                id: TRACKER.to_owned(),
            })
            .await;
        assert_eq!(events, vec![WatcherEvent::Disconnected]);
        assert_eq!(watcher.state(), &WatcherState::Disconnected);

        let events = watcher.handle_event(discovered("hci0/dev_other", "OtherDevice")).await;
        assert_eq!(events, vec![]);
        assert_eq!(watcher.state(), &WatcherState::Scanning);
    }

    #[tokio::test]
    async fn missing_service_disconnects() {
        let adapter = FakeAdapter::with_value(&[2]);
        adapter.missing_service();
        let mut watcher = scanning_watcher(&adapter).await;

        let events = watcher.handle_event(discovered(TRACKER, "FitTrack")).await;
        assert_eq!(events.last(), Some(&WatcherEvent::Disconnected));
        assert_eq!(watcher.state(), &WatcherState::Scanning);
        let calls = adapter.calls();
        assert!(calls.contains(&format!("disconnect {}", TRACKER)));
        assert!(!calls.iter().any(|call| call.starts_with("subscribe")));
    }

    #[tokio::test]
    async fn missing_characteristic_disconnects() {
        let adapter = FakeAdapter::with_value(&[2]);
        adapter.missing_characteristic();
        let mut watcher = scanning_watcher(&adapter).await;

        let events = watcher.handle_event(discovered(TRACKER, "FitTrack")).await;
        assert_eq!(events.last(), Some(&WatcherEvent::Disconnected));
        assert_eq!(watcher.state(), &WatcherState::Scanning);
        assert!(adapter
            .calls()
            .contains(&format!("disconnect {}", TRACKER)));
    }

    #[tokio::test]
    async fn values_only_from_subscribed_characteristic() {
        let adapter = FakeAdapter::with_value(&[0]);
        let mut watcher = scanning_watcher(&adapter).await;
        watcher.handle_event(discovered(TRACKER, "FitTrack")).await;

        let events = watcher
            .handle_event(AdapterEvent::Value {
                id: FakeAdapter::characteristic_id(TRACKER),
                value: vec![1],
            })
            .await;
        assert_eq!(events, vec![WatcherEvent::CharacteristicValue(vec![1])]);

        let events = watcher
            .handle_event(AdapterEvent::Value {
                id: "hci0/dev_other/service/char".to_owned(),
                value: vec![2],
            })
            .await;
        assert_eq!(events, vec![]);
    }

    #[tokio::test]
    async fn link_loss_resumes_scanning() {
        let adapter = FakeAdapter::with_value(&[0]);
        let mut watcher = scanning_watcher(&adapter).await;
        watcher.handle_event(discovered(TRACKER, "FitTrack")).await;

        // Some other device disconnecting doesn't matter.
        let events = watcher
            .handle_event(AdapterEvent::Disconnected {
                id: "hci0/dev_other".to_owned(),
            })
            .await;
        assert_eq!(events, vec![]);

        let events = watcher
            .handle_event(AdapterEvent::Disconnected {
                id: TRACKER.to_owned(),
            })
            .await;
        assert_eq!(events, vec![WatcherEvent::Disconnected]);
        assert_eq!(watcher.state(), &WatcherState::Scanning);
        assert_eq!(adapter.calls().last().unwrap(), "start_scan");

        // Values which were already queued are dropped.
        let events = watcher
            .handle_event(AdapterEvent::Value {
                id: FakeAdapter::characteristic_id(TRACKER),
                value: vec![1],
            })
            .await;
        assert_eq!(events, vec![]);
    }

    #[tokio::test]
    async fn stop_unsubscribes_and_disconnects() {
        let adapter = FakeAdapter::with_value(&[0]);
        let mut watcher = scanning_watcher(&adapter).await;
        watcher.handle_event(discovered(TRACKER, "FitTrack")).await;

        watcher.stop().await;
        assert_eq!(watcher.state(), &WatcherState::Idle);
        let calls = adapter.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            &[
                format!("unsubscribe {}", FakeAdapter::characteristic_id(TRACKER)),
                format!("disconnect {}", TRACKER),
            ]
        );

        // Stopping again does nothing.
        watcher.stop().await;
        assert_eq!(adapter.calls().len(), calls.len());
    }

    #[tokio::test]
    async fn stop_while_scanning() {
        let adapter = FakeAdapter::with_value(&[0]);
        let mut watcher = scanning_watcher(&adapter).await;
        watcher.stop().await;
        assert_eq!(adapter.calls(), vec!["start_scan", "stop_scan"]);
        assert_eq!(watcher.state(), &WatcherState::Idle);
    }

    #[tokio::test]
    async fn stop_when_idle() {
        let adapter = FakeAdapter::with_value(&[0]);
        let mut watcher = PeripheralWatcher::new(adapter.clone(), "FitTrack");
        watcher.stop().await;
        assert_eq!(adapter.calls(), Vec::<String>::new());
    }
}
