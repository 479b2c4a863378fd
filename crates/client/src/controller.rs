// Presence Controller
//
// One task owns the connection, the peer registry and the sampler. Commands,
// transport events, position samples and sweep ticks are multiplexed with
// `tokio::select!`, so handlers never run concurrently and nothing is locked.
// Observers read a `PresenceView` through a watch channel.

use crate::connection::{ConnectionManager, ConnectionState, Dispatch};
use crate::registry::{PeerRegistry, PeerSighting};
use crate::transport::{EventReceiver, SessionEvent, Transport};
use crate::view::{classify, PresenceView, SelfLocation};
use geopresence_core::{now_millis, Config, Identity};
use geopresence_sensor::{GeoSampler, PositionSample, PositionSource, Sampling, SamplingOptions, SensorError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

type StartResult = Result<Sampling, SensorError>;

/// Tunables of the presence loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceSettings {
    pub stale: Duration,
    pub sweep_interval: Duration,
    pub proximity_m: f64,
    pub sampling: SamplingOptions,
}

impl From<&Config> for PresenceSettings {
    fn from(config: &Config) -> Self {
        Self {
            stale: Duration::from_millis(config.presence.stale_ms),
            sweep_interval: Duration::from_millis(config.presence.sweep_interval_ms),
            proximity_m: config.presence.proximity_m,
            sampling: SamplingOptions::from(&config.sampling),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug)]
enum Command {
    Connect { endpoint: String, room: String },
    Disconnect,
    StartSharing,
    StopSharing,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("presence controller is not running")]
    Stopped,
}

/// Cloneable command and observation handle
#[derive(Debug, Clone)]
pub struct PresenceHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<PresenceView>,
}

impl PresenceHandle {
    fn send(&self, command: Command) -> Result<(), ControllerError> {
        self.commands.send(command).map_err(|_| ControllerError::Stopped)
    }

    /// Join `room` on `endpoint`, leaving the current room first
    pub fn connect(&self, endpoint: impl Into<String>, room: impl Into<String>) -> Result<(), ControllerError> {
        self.send(Command::Connect {
            endpoint: endpoint.into(),
            room: room.into(),
        })
    }

    pub fn disconnect(&self) -> Result<(), ControllerError> {
        self.send(Command::Disconnect)
    }

    pub fn start_sharing(&self) -> Result<(), ControllerError> {
        self.send(Command::StartSharing)
    }

    pub fn stop_sharing(&self) -> Result<(), ControllerError> {
        self.send(Command::StopSharing)
    }

    /// Stop the controller and wait until it has left the room
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Shutdown(done_tx))?;
        done_rx.await.map_err(|_| ControllerError::Stopped)
    }

    pub fn view(&self) -> watch::Receiver<PresenceView> {
        self.view.clone()
    }

    pub fn current(&self) -> PresenceView {
        self.view.borrow().clone()
    }
}

pub struct PresenceController<T: Transport> {
    settings: PresenceSettings,
    connection: ConnectionManager<T>,
    registry: PeerRegistry,
    sampler: GeoSampler,
    sampling: Option<Sampling>,
    /// Subscription being opened off the loop
    starting: Option<oneshot::Receiver<StartResult>>,
    self_location: Option<SelfLocation>,
    sensor_error: Option<String>,
    room: Option<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: EventReceiver,
    view: watch::Sender<PresenceView>,
}

impl<T: Transport + 'static> PresenceController<T> {
    /// Create a controller with a freshly generated identity
    pub fn new(
        settings: PresenceSettings,
        transport: T,
        source: Arc<dyn PositionSource>,
    ) -> (Self, PresenceHandle) {
        Self::with_identity(Identity::generate(), settings, transport, source)
    }

    pub fn with_identity(
        identity: Identity,
        settings: PresenceSettings,
        transport: T,
        source: Arc<dyn PositionSource>,
    ) -> (Self, PresenceHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(PresenceView::new(identity.clone()));

        let controller = Self {
            settings,
            connection: ConnectionManager::new(transport, identity.clone(), event_tx),
            registry: PeerRegistry::new(identity, settings.stale),
            sampler: GeoSampler::new(source, settings.sampling),
            sampling: None,
            starting: None,
            self_location: None,
            sensor_error: None,
            room: None,
            commands: command_rx,
            events: event_rx,
            view: view_tx,
        };
        let handle = PresenceHandle {
            commands: command_tx,
            view: view_rx,
        };
        (controller, handle)
    }

    pub fn identity(&self) -> &Identity {
        self.connection.identity()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        tracing::info!("Presence controller started as {}", self.identity());

        let period = self.settings.sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.teardown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("All presence handles dropped");
                        self.teardown();
                        break;
                    }
                },

                Some(event) = self.events.recv() => self.handle_session_event(event),

                started = sampling_started(&mut self.starting) => self.handle_started(started),

                sample = next_sample(&mut self.sampling) => self.handle_sample(sample),

                _ = sweep.tick() => {
                    self.registry.sweep(now_millis());
                    self.publish();
                }
            }
        }

        tracing::info!("Presence controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, room } => {
                if self.room.as_deref() != Some(room.as_str()) {
                    self.registry.clear();
                }
                self.room = Some(room.clone());
                if let Err(e) = self.connection.connect(&endpoint, &room) {
                    tracing::warn!("Connect to {} failed: {}", endpoint, e);
                }
            }
            Command::Disconnect => {
                self.connection.disconnect();
                self.registry.clear();
                self.room = None;
            }
            Command::StartSharing => self.start_sharing(),
            Command::StopSharing => self.stop_sharing(),
            // Handled by the loop
            Command::Shutdown(_) => {}
        }
        self.publish();
    }

    /// Subscribe in a separate task; the result arrives through `starting`
    fn start_sharing(&mut self) {
        if self.starting.is_some() || self.sampling.as_ref().is_some_and(Sampling::is_active) {
            return;
        }
        let sampler = self.sampler.clone();
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = started_tx.send(sampler.start().await);
        });
        self.starting = Some(started_rx);
    }

    fn handle_started(&mut self, started: Result<StartResult, oneshot::error::RecvError>) {
        self.starting = None;
        match started {
            Ok(Ok(sampling)) => self.sampling = Some(sampling),
            Ok(Err(e)) => {
                tracing::error!("Failed to start position sampling: {}", e);
                self.sensor_error = Some(e.to_string());
            }
            Err(_) => tracing::warn!("Position sampling start was abandoned"),
        }
        self.publish();
    }

    /// A subscription still being opened is dropped, which cancels it on arrival
    fn stop_sharing(&mut self) {
        self.starting = None;
        if let Some(mut sampling) = self.sampling.take() {
            sampling.cancel();
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match self.connection.handle_event(event) {
            Some(Dispatch::Location(update)) => match update.coordinate() {
                Ok(coordinate) => {
                    self.registry.upsert(
                        PeerSighting {
                            id: update.id,
                            coordinate,
                            source_timestamp: update.ts,
                        },
                        now_millis(),
                    );
                }
                Err(e) => tracing::warn!("Dropping location from {}: {}", update.id, e),
            },
            Some(Dispatch::Leave(id)) => {
                if self.registry.remove(&id) {
                    tracing::debug!("{} left", id);
                }
            }
            None => {}
        }
        self.publish();
    }

    fn handle_sample(&mut self, sample: Option<Result<PositionSample, SensorError>>) {
        match sample {
            Some(Ok(sample)) => {
                self.self_location = Some(SelfLocation {
                    coordinate: sample.coordinate,
                    captured_at: sample.captured_at,
                });
                self.sensor_error = None;
                self.connection
                    .send_location(sample.coordinate, sample.captured_at);
            }
            Some(Err(e)) => {
                tracing::error!("Position sampling failed: {}", e);
                self.sensor_error = Some(e.to_string());
            }
            None => self.sampling = None,
        }
        self.publish();
    }

    /// Stop sampling first, then leave and close
    fn teardown(&mut self) {
        self.stop_sharing();
        self.connection.disconnect();
        self.registry.clear();
        self.room = None;
        self.publish();
    }

    fn publish(&mut self) {
        let transitions = self.connection.take_transitions();
        if let Some((_, passed)) = transitions.split_last() {
            for status in passed {
                self.publish_status(*status);
            }
        }
        self.publish_status(self.connection.state());
    }

    fn publish_status(&self, status: ConnectionState) {
        let next = self.build_view(status);
        self.view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn build_view(&self, status: ConnectionState) -> PresenceView {
        let snapshot = self.registry.snapshot();
        PresenceView {
            status,
            error: self
                .connection
                .last_error()
                .map(str::to_string)
                .or_else(|| self.sensor_error.clone()),
            self_identity: self.identity().clone(),
            room: self.room.clone(),
            self_location: self.self_location,
            sharing: self.sampling.is_some() || self.starting.is_some(),
            peers: classify(self.self_location.as_ref(), &snapshot, self.settings.proximity_m),
        }
    }
}

async fn sampling_started(
    starting: &mut Option<oneshot::Receiver<StartResult>>,
) -> Result<StartResult, oneshot::error::RecvError> {
    match starting {
        Some(started) => started.await,
        None => std::future::pending().await,
    }
}

async fn next_sample(sampling: &mut Option<Sampling>) -> Option<Result<PositionSample, SensorError>> {
    match sampling {
        Some(sampling) => sampling.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, TransportEvent};
    use async_trait::async_trait;
    use geopresence_core::Coordinate;
    use geopresence_sensor::{PositionStream, ScriptedSource};

    const WAIT: Duration = Duration::from_secs(5);

    fn settings() -> PresenceSettings {
        PresenceSettings {
            sampling: SamplingOptions {
                high_accuracy: false,
                max_age: Duration::from_millis(5_000),
                timeout: Duration::from_millis(10_000),
            },
            ..PresenceSettings::default()
        }
    }

    fn start(
        settings: PresenceSettings,
        source: ScriptedSource,
    ) -> (PresenceHandle, MemoryTransport, JoinHandle<()>) {
        let transport = MemoryTransport::new();
        let (controller, handle) = PresenceController::with_identity(
            Identity::from("a"),
            settings,
            transport.clone(),
            Arc::new(source),
        );
        (handle, transport, controller.spawn())
    }

    async fn wait_view(
        handle: &PresenceHandle,
        predicate: impl FnMut(&PresenceView) -> bool,
    ) -> PresenceView {
        let mut view = handle.view();
        let seen = tokio::time::timeout(WAIT, view.wait_for(predicate))
            .await
            .expect("timed out waiting for view")
            .expect("controller stopped");
        (*seen).clone()
    }

    async fn connect(handle: &PresenceHandle, transport: &MemoryTransport, room: &str) {
        let sessions = transport.session_count();
        handle.connect("ws://relay", room).unwrap();
        let room_owned = room.to_string();
        wait_view(handle, |v| {
            v.status == ConnectionState::Connecting && v.room.as_deref() == Some(room_owned.as_str())
        })
        .await;
        assert_eq!(transport.session_count(), sessions + 1);
        transport.emit(sessions, TransportEvent::Established);
        wait_view(handle, |v| v.status == ConnectionState::Connected).await;
    }

    fn location(room: &str, id: &str, lat: f64, lon: f64) -> TransportEvent {
        TransportEvent::Message(format!(
            r#"{{"type":"location","room":"{}","id":"{}","lat":{},"lon":{},"ts":1}}"#,
            room, id, lat, lon
        ))
    }

    #[tokio::test]
    async fn test_room_isolation() {
        let (handle, transport, _task) = start(settings(), ScriptedSource::silent());
        connect(&handle, &transport, "r").await;

        transport.emit(0, location("r2", "c", 1.0, 1.0));
        transport.emit(0, location("r", "b", 1.0, 1.0));

        let view = wait_view(&handle, |v| !v.peers.is_empty()).await;
        assert_eq!(view.peers.len(), 1);
        assert_eq!(view.peers[0].id, Identity::from("b"));
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_disturb_state() {
        let (handle, transport, _task) = start(settings(), ScriptedSource::silent());
        connect(&handle, &transport, "r").await;

        transport.emit(0, TransportEvent::Message("{not json".to_string()));
        transport.emit(0, TransportEvent::Message(r#"{"type":"location","room":"r"}"#.to_string()));
        transport.emit(0, location("r", "b", 95.0, 1.0));
        transport.emit(0, location("r", "b", 1.0, 1.0));

        let view = wait_view(&handle, |v| !v.peers.is_empty()).await;
        assert_eq!(view.status, ConnectionState::Connected);
        assert_eq!(view.error, None);
        assert_eq!(view.peers[0].coordinate, Coordinate::new(1.0, 1.0).unwrap());
    }

    #[tokio::test]
    async fn test_room_switch_clears_peers() {
        let (handle, transport, _task) = start(settings(), ScriptedSource::silent());
        connect(&handle, &transport, "r").await;
        transport.emit(0, location("r", "b", 1.0, 1.0));
        wait_view(&handle, |v| v.peers.len() == 1).await;

        connect(&handle, &transport, "r2").await;
        let view = handle.current();
        assert!(view.peers.is_empty());
        assert!(transport.is_closed(0));
        assert!(transport.sent(0).last().unwrap().contains(r#""type":"leave""#));
        assert!(transport.sent(1)[0].contains(r#""room":"r2""#));
    }

    #[tokio::test]
    async fn test_peer_leave_removes_record() {
        let (handle, transport, _task) = start(settings(), ScriptedSource::silent());
        connect(&handle, &transport, "r").await;
        transport.emit(0, location("r", "b", 1.0, 1.0));
        wait_view(&handle, |v| v.peers.len() == 1).await;

        transport.emit(
            0,
            TransportEvent::Message(r#"{"type":"leave","room":"r","id":"b"}"#.to_string()),
        );
        wait_view(&handle, |v| v.peers.is_empty()).await;
    }

    #[tokio::test]
    async fn test_samples_are_broadcast_and_classify_peers() {
        let me = Coordinate::new(0.0, 0.0).unwrap();
        let (handle, transport, _task) = start(
            settings(),
            ScriptedSource::fixed(me, Duration::from_millis(20)),
        );
        connect(&handle, &transport, "r").await;
        handle.start_sharing().unwrap();

        transport.emit(0, location("r", "near", 0.0, 0.0449));
        transport.emit(0, location("r", "far", 0.0, 0.05));

        let view = wait_view(&handle, |v| v.self_location.is_some() && v.peers.len() == 2).await;
        assert!(view.sharing);
        let close: Vec<_> = view.close_peers().map(|p| p.id.as_str().to_string()).collect();
        assert_eq!(close, vec!["near".to_string()]);

        let sent = transport.sent(0);
        assert!(sent.iter().any(|f| f.contains(r#""type":"location""#) && f.contains(r#""id":"a""#)));
    }

    /// Takes seconds to open, like gpsd behind an unresponsive host
    struct SlowSource;

    #[async_trait]
    impl PositionSource for SlowSource {
        fn source_name(&self) -> &str {
            "slow"
        }

        async fn subscribe(&self, options: &SamplingOptions) -> Result<PositionStream, SensorError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            ScriptedSource::silent().subscribe(options).await
        }
    }

    #[tokio::test]
    async fn test_slow_subscribe_does_not_stall_the_loop() {
        let transport = MemoryTransport::new();
        let (controller, handle) = PresenceController::with_identity(
            Identity::from("a"),
            settings(),
            transport.clone(),
            Arc::new(SlowSource),
        );
        let _task = controller.spawn();

        handle.start_sharing().unwrap();
        handle.connect("ws://relay", "r").unwrap();

        let quick = Duration::from_millis(1_500);
        let mut view = handle.view();
        let connecting = matches!(
            tokio::time::timeout(quick, view.wait_for(|v| v.status == ConnectionState::Connecting)).await,
            Ok(Ok(_))
        );
        assert!(connecting, "connect was not handled while subscribe was pending");
        assert!(handle.current().sharing);

        transport.emit(0, TransportEvent::Established);
        let connected = matches!(
            tokio::time::timeout(quick, view.wait_for(|v| v.status == ConnectionState::Connected)).await,
            Ok(Ok(_))
        );
        assert!(connected);
        assert!(transport.sent(0)[0].contains(r#""type":"join""#));

        // Stopping before the subscription lands abandons it
        handle.stop_sharing().unwrap();
        let view = wait_view(&handle, |v| !v.sharing).await;
        assert_eq!(view.status, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_sensor_error_surfaces_without_touching_connection() {
        let (handle, transport, _task) = start(
            settings(),
            ScriptedSource::failing(SensorError::PermissionDenied),
        );
        connect(&handle, &transport, "r").await;
        handle.start_sharing().unwrap();

        let view = wait_view(&handle, |v| v.error.is_some()).await;
        assert_eq!(view.status, ConnectionState::Connected);
        assert!(!view.sharing);
        assert!(view.error.unwrap().contains("denied"));
    }

    #[tokio::test]
    async fn test_transport_error_is_shown() {
        let (handle, transport, _task) = start(settings(), ScriptedSource::silent());
        connect(&handle, &transport, "r").await;
        transport.emit(0, TransportEvent::Error("connection reset".to_string()));

        let view = wait_view(&handle, |v| v.status == ConnectionState::Disconnected).await;
        assert_eq!(view.error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_stale_peers_are_swept() {
        let settings = PresenceSettings {
            stale: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(20),
            ..settings()
        };
        let (handle, transport, _task) = start(settings, ScriptedSource::silent());
        connect(&handle, &transport, "r").await;

        transport.emit(0, location("r", "b", 1.0, 1.0));
        wait_view(&handle, |v| v.peers.len() == 1).await;
        wait_view(&handle, |v| v.peers.is_empty()).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_sampling_then_leaves() {
        let me = Coordinate::new(10.0, 10.0).unwrap();
        let (handle, transport, task) = start(
            settings(),
            ScriptedSource::fixed(me, Duration::from_millis(10)),
        );
        connect(&handle, &transport, "r").await;
        handle.start_sharing().unwrap();
        wait_view(&handle, |v| v.self_location.is_some()).await;

        handle.shutdown().await.unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

        let view = handle.current();
        assert_eq!(view.status, ConnectionState::Disconnected);
        assert!(!view.sharing);
        assert!(transport.is_closed(0));
        assert_eq!(
            transport.sent(0).last().unwrap(),
            r#"{"type":"leave","room":"r","id":"a"}"#
        );
        assert_eq!(handle.connect("ws://relay", "r"), Err(ControllerError::Stopped));
    }

    #[tokio::test]
    async fn test_dropping_handles_tears_down() {
        let (handle, transport, task) = start(settings(), ScriptedSource::silent());
        connect(&handle, &transport, "r").await;

        drop(handle);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(transport.is_closed(0));
    }
}
