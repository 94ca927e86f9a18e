use crate::activity::ActivityCode;
use crate::telemetry::{TelemetryDispatcher, TelemetryTransport};
use crate::tracker::ActivityTracker;
use crate::watcher::{AdapterEvent, BleAdapter, PeripheralWatcher, ScanError, WatcherEvent};
use crate::BoxError;
use futures::{Stream, StreamExt};
use std::future::Future;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const COMMANDS_CAP: usize = 4;

/// Error type for the future returned by `ActivityBridge::run`.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("Bluetooth adapter event stream ended")]
    EventStreamEnded,
    #[error("Bridge is not running")]
    NotRunning,
}

#[derive(Debug)]
enum Command {
    Stop { done: oneshot::Sender<()> },
}

/// A handle to control a running `ActivityBridge` from another task.
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    commands: mpsc::Sender<Command>,
}

impl BridgeHandle {
    /// Stop the bridge. When this returns, notifications have been stopped, the tracker has been
    /// disconnected and no more telemetry will be sent.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { done: done_tx })
            .await
            .map_err(|_| BridgeError::NotRunning)?;
        done_rx.await.map_err(|_| BridgeError::NotRunning)
    }
}

/// Watches a FitTrack tracker and sends each change in its activity to the cloud.
///
/// All state is owned by the task which calls `run`; Bluetooth events, the cloud session and
/// commands from `BridgeHandle` are all funnelled into it and handled one at a time, in order.
#[derive(Debug)]
pub struct ActivityBridge<A: BleAdapter, T> {
    watcher: PeripheralWatcher<A>,
    tracker: ActivityTracker,
    dispatcher: TelemetryDispatcher<T>,
    commands: mpsc::Receiver<Command>,
}

impl<A: BleAdapter, T: TelemetryTransport + 'static> ActivityBridge<A, T> {
    /// Create a new bridge which will connect to the first peripheral found with the given name.
    pub fn new(adapter: A, peripheral_name: &str) -> (Self, BridgeHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMANDS_CAP);
        let bridge = Self {
            watcher: PeripheralWatcher::new(adapter, peripheral_name),
            tracker: ActivityTracker::new(),
            dispatcher: TelemetryDispatcher::new(),
            commands: commands_rx,
        };
        (
            bridge,
            BridgeHandle {
                commands: commands_tx,
            },
        )
    }

    pub fn watcher(&self) -> &PeripheralWatcher<A> {
        &self.watcher
    }

    pub fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &TelemetryDispatcher<T> {
        &self.dispatcher
    }

    /// Start scanning, and handle events until the bridge is stopped.
    ///
    /// # Arguments
    /// * `events`: The stream of events from the Bluetooth adapter.
    /// * `session`: A future which establishes the cloud session. This is spawned as a separate
    ///   task so that it doesn't hold up connecting to the tracker. Until it completes, activity
    ///   changes are dropped.
    pub async fn run<S, F>(mut self, mut events: S, session: F) -> Result<(), BridgeError>
    where
        S: Stream<Item = AdapterEvent<A::PeripheralId, A::CharacteristicId>> + Unpin,
        F: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let (session_tx, mut session_rx) = oneshot::channel();
        self.dispatcher.mark_connecting();
        tokio::spawn(async move {
            // The receiver is only gone if the bridge has already stopped.
            let _ = session_tx.send(session.await);
        });
        let mut session_pending = true;
        let mut commands_open = true;

        self.watcher.start_scan().await?;

        loop {
            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Stop { done }) => {
                        self.stop().await;
                        let _ = done.send(());
                        return Ok(());
                    }
                    None => {
                        log::debug!("All bridge handles dropped");
                        commands_open = false;
                    }
                },
                result = &mut session_rx, if session_pending => {
                    session_pending = false;
                    let result = result.unwrap_or_else(|_| Err("Session task panicked".into()));
                    self.handle_session(result).await;
                }
                event = events.next() => match event {
                    Some(event) => self.handle_adapter_event(event).await,
                    None => {
                        self.stop().await;
                        return Err(BridgeError::EventStreamEnded);
                    }
                },
            }
        }
    }

    /// Pass an adapter event through the watcher, and act on the results.
    pub async fn handle_adapter_event(
        &mut self,
        event: AdapterEvent<A::PeripheralId, A::CharacteristicId>,
    ) {
        for event in self.watcher.handle_event(event).await {
            match event {
                WatcherEvent::Connecting(_) => self.tracker.mark_connecting(),
                WatcherEvent::Connected(_) => self.tracker.mark_connected(),
                WatcherEvent::Disconnected => self.tracker.mark_disconnected(),
                WatcherEvent::CharacteristicValue(value) => self.handle_value(&value).await,
            }
        }
    }

    async fn handle_value(&mut self, value: &[u8]) {
        let code = ActivityCode::decode(value).unwrap_or_else(|e| {
            log::warn!("{}, assuming no activity", e);
            ActivityCode::None
        });
        if let Some(code) = self.tracker.observe(code) {
            self.dispatch(code).await;
        }
    }

    /// Store the result of establishing the cloud session. If there is already a current activity,
    /// it is sent straight away.
    pub async fn handle_session(&mut self, result: Result<T, BoxError>) {
        match result {
            Ok(session) => {
                log::info!("Cloud session established");
                self.dispatcher.establish_session(session);
                if let Some(code) = self.tracker.current() {
                    self.dispatch(code).await;
                }
            }
            Err(e) => {
                log::error!("Failed to establish cloud session: {}", e);
                self.dispatcher.mark_failed();
            }
        }
    }

    async fn dispatch(&self, code: ActivityCode) {
        if let Err(e) = self.dispatcher.send(code).await {
            log::warn!("Failed to send activity {}: {}", code, e);
        }
    }

    /// Stop the watcher. No further events will be acted on.
    pub async fn stop(&mut self) {
        self.watcher.stop().await;
        self.tracker.mark_disconnected();
    }
}
