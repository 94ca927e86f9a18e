//! Fake implementations of the Bluetooth and telemetry collaborators, which record how they were
//! used.

use crate::telemetry::{TelemetryMessage, TelemetryTransport};
use crate::watcher::BleAdapter;
use crate::BoxError;
use async_trait::async_trait;
use futures::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("Fake failure: {0}")]
pub struct FakeError(&'static str);

#[derive(Debug, Default)]
struct FakeAdapterState {
    calls: Vec<String>,
    value: Vec<u8>,
    fail_scan: bool,
    fail_next_scan: bool,
    fail_connect: bool,
    fail_next_connect: bool,
    missing_service: bool,
    missing_characteristic: bool,
}

#[derive(Clone, Debug, Default)]
pub struct FakeAdapter {
    state: Arc<Mutex<FakeAdapterState>>,
}

impl FakeAdapter {
    /// Create an adapter where every read of the activity characteristic returns the given value.
    pub fn with_value(value: &[u8]) -> Self {
        let adapter = Self::default();
        adapter.state.lock().unwrap().value = value.to_vec();
        adapter
    }

    pub fn characteristic_id(peripheral: &str) -> String {
        format!("{}/service/char", peripheral)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_scan(&self) {
        self.state.lock().unwrap().fail_scan = true;
    }

    /// Make only the next call to `start_scan` fail.
    pub fn fail_next_scan(&self) {
        self.state.lock().unwrap().fail_next_scan = true;
    }

    pub fn fail_connect(&self) {
        self.state.lock().unwrap().fail_connect = true;
    }

    pub fn fail_next_connect(&self) {
        self.state.lock().unwrap().fail_next_connect = true;
    }

    pub fn missing_service(&self) {
        self.state.lock().unwrap().missing_service = true;
    }

    pub fn missing_characteristic(&self) {
        self.state.lock().unwrap().missing_characteristic = true;
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, FakeAdapterState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    type PeripheralId = String;
    type ServiceId = String;
    type CharacteristicId = String;
    type Error = FakeError;

    async fn start_scan(&self) -> Result<(), FakeError> {
        let mut state = self.record("start_scan".to_owned());
        if state.fail_scan || std::mem::take(&mut state.fail_next_scan) {
            return Err(FakeError("scan"));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), FakeError> {
        self.record("stop_scan".to_owned());
        Ok(())
    }

    async fn connect(&self, peripheral: &String) -> Result<(), FakeError> {
        let mut state = self.record(format!("connect {}", peripheral));
        if state.fail_connect || std::mem::take(&mut state.fail_next_connect) {
            return Err(FakeError("connect"));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &String) -> Result<(), FakeError> {
        self.record(format!("disconnect {}", peripheral));
        Ok(())
    }

    async fn get_service(&self, peripheral: &String, uuid: Uuid) -> Result<String, FakeError> {
        if self.record(format!("get_service {}", uuid)).missing_service {
            return Err(FakeError("no service"));
        }
        Ok(format!("{}/service", peripheral))
    }

    async fn get_characteristic(&self, service: &String, uuid: Uuid) -> Result<String, FakeError> {
        if self
            .record(format!("get_characteristic {}", uuid))
            .missing_characteristic
        {
            return Err(FakeError("no characteristic"));
        }
        Ok(format!("{}/char", service))
    }

    async fn read(&self, characteristic: &String) -> Result<Vec<u8>, FakeError> {
        Ok(self.record(format!("read {}", characteristic)).value.clone())
    }

    async fn subscribe(&self, characteristic: &String) -> Result<(), FakeError> {
        self.record(format!("subscribe {}", characteristic));
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &String) -> Result<(), FakeError> {
        self.record(format!("unsubscribe {}", characteristic));
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeTransport {
    sent: Arc<Mutex<Vec<TelemetryMessage>>>,
    attempts: Arc<AtomicUsize>,
    fail: bool,
    block: bool,
}

impl FakeTransport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// A transport which never finishes sending anything.
    pub fn blocking() -> Self {
        Self {
            block: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<TelemetryMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// The payloads of all messages sent so far, as strings.
    pub fn payloads(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .map(|message| String::from_utf8(message.payload).unwrap())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetryTransport for FakeTransport {
    async fn send_event(&self, message: TelemetryMessage) -> Result<(), BoxError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.block {
            future::pending::<()>().await;
        }
        if self.fail {
            return Err(Box::new(FakeError("send")));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}
