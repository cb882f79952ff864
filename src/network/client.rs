use super::connection::{
    BoxedStream, ConnectionError, Connector, Endpoint, SessionEvent, TcpConnector, TransportSession,
};
use super::events::{DeviceInfoProvider, DisconnectReason, EventSink, SystemDeviceInfo};
use super::lifecycle::{ConnectionLifecycle, ConnectionState, ReconnectDecision, ReconnectPolicy};
use super::reachability::{NetworkPath, ReachabilityMonitor};
use super::scheduler::ScheduledTask;
use crate::messages::{
    ClientRegistration, DeviceInfo, Envelope, FramedMessage, MessageKind, ServerErrorPayload,
    UpdatePayload, WireConfig,
};
use crate::recovery::{
    ErrorContext, ErrorPresentation, ErrorRecord, ErrorRecoveryEngine, RecoveryConfig,
    RecoveryDecision, RecoveryDiagnostics, DEFAULT_HISTORY_LIMIT,
};
use crate::state::{
    default_snapshot_dir, PersistenceWorker, PreservationResult, SnapshotConfig,
    SnapshotDiagnostics, SnapshotStats, SnapshotStore, SourceArtifact, StateSnapshot,
    StateSnapshotService, StateStore, StateValue, StorageError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Errors returned by [`LiveClient`] operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Snapshot storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ClientError::Connection(ConnectionError::ClientShutdown))
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(ConnectionError::NotConnected { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

/// Everything the client needs to know up front
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: Endpoint,
    pub client_id: String,
    pub client_name: String,
    /// Sent in the handshake
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatConfig,
    pub auto_recovery: bool,
    pub error_history_limit: usize,
    pub snapshots: SnapshotConfig,
    pub wire: WireConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("127.0.0.1", 8080),
            client_id: uuid::Uuid::new_v4().to_string(),
            client_name: "livelink".to_string(),
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            auto_recovery: true,
            error_history_limit: DEFAULT_HISTORY_LIMIT,
            snapshots: SnapshotConfig::default(),
            wire: WireConfig::default(),
        }
    }
}

impl ClientOptions {
    /// Recovery shares the reconnect cap and backoff so both give up together
    fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            auto_recovery: self.auto_recovery,
            max_attempts: self.reconnect.max_attempts,
            backoff: self.reconnect.backoff,
            history_limit: self.error_history_limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub successful_connections: u64,
    pub reconnects_scheduled: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub heartbeats_sent: u64,
    pub heartbeats_acknowledged: u64,
}

/// Point-in-time view of the whole client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDiagnostics {
    pub client_id: String,
    pub endpoint: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub manual_disconnect: bool,
    pub heartbeat_pending: bool,
    pub connection: ConnectionStats,
    pub recovery: RecoveryDiagnostics,
    pub snapshots: SnapshotStats,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    Send(Envelope, Reply<Result<(), ClientError>>),
    Register(ClientRegistration, Reply<Result<(), ClientError>>),
    TriggerRecovery(Reply<RecoveryDecision>),
    ClearError(Reply<()>),
    Diagnostics(Reply<ClientDiagnostics>),
    SetEventSink(Option<Arc<dyn EventSink>>, Reply<()>),
    AttachStateStore(Option<Arc<dyn StateStore>>, Reply<()>),
    CreateSnapshot(SourceArtifact, BTreeMap<String, StateValue>, Reply<StateSnapshot>),
    RestoreState(SourceArtifact, Arc<dyn StateStore>, Reply<PreservationResult>),
    ShouldPreserve(Option<SourceArtifact>, SourceArtifact, Reply<bool>),
    ClearSnapshots(Reply<usize>),
    SnapshotStats(Reply<SnapshotStats>),
    ExportDiagnostics(Reply<SnapshotDiagnostics>),
    /// Answered by the persistence task once earlier writes are done
    FlushPersistence(oneshot::Sender<()>),
    Shutdown(Option<Reply<()>>),
}

/// Everything the worker reacts to, in arrival order
enum WorkerEvent {
    Command(Command),
    Opened {
        generation: u64,
        result: Result<BoxedStream, ConnectionError>,
    },
    Session {
        generation: u64,
        event: SessionEvent,
    },
    HeartbeatDue {
        token: u64,
    },
    RetryDue {
        token: u64,
        reconnect: bool,
    },
    PersistenceFailed(StorageError),
}

struct ClientInner {
    tx: mpsc::UnboundedSender<WorkerEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    client_id: String,
    platform: String,
    device: DeviceInfo,
    endpoint: Endpoint,
    client_name: String,
    headers: BTreeMap<String, String>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerEvent::Command(Command::Shutdown(None)));
    }
}

/// Handle to a live-update client. Cheap to clone; the worker shuts down
/// when the last handle is dropped or [`LiveClient::shutdown`] is called.
#[derive(Clone)]
pub struct LiveClient {
    inner: Arc<ClientInner>,
}

impl LiveClient {
    pub fn builder(options: ClientOptions) -> LiveClientBuilder {
        LiveClientBuilder::new(options)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Current connection state, without a round trip to the worker
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Wait until the client reaches `target`. False on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow() == target;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .send(WorkerEvent::Command(build(reply_tx)))
            .map_err(|_| ConnectionError::ClientShutdown)?;
        reply_rx
            .await
            .map_err(|_| ClientError::from(ConnectionError::ClientShutdown))
    }

    /// Open the connection. No-op while connecting or connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.request(Command::Connect).await
    }

    /// Close the connection and suppress automatic reconnects
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(Command::Disconnect).await
    }

    /// Send an application message of `message_type`
    pub async fn send(
        &self,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Result<(), ClientError> {
        let envelope = Envelope::new(
            message_type,
            self.inner.client_id.clone(),
            self.inner.platform.clone(),
            payload,
        );
        self.send_envelope(envelope).await
    }

    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.request(|reply| Command::Send(envelope, reply)).await?
    }

    /// Send the handshake now, or as soon as the connection opens. It is
    /// re-sent after every reconnect.
    pub async fn register_client(
        &self,
        capabilities: Vec<String>,
        device: Option<DeviceInfo>,
    ) -> Result<(), ClientError> {
        let registration = ClientRegistration {
            client_name: self.inner.client_name.clone(),
            capabilities,
            device: device.unwrap_or_else(|| self.inner.device.clone()),
            endpoint: self.inner.endpoint.url(),
            headers: self.inner.headers.clone(),
        };
        self.request(|reply| Command::Register(registration, reply))
            .await?
    }

    /// User-initiated retry of the current error
    pub async fn trigger_recovery(&self) -> Result<RecoveryDecision, ClientError> {
        self.request(Command::TriggerRecovery).await
    }

    pub async fn clear_error(&self) -> Result<(), ClientError> {
        self.request(Command::ClearError).await
    }

    pub async fn diagnostics(&self) -> Result<ClientDiagnostics, ClientError> {
        self.request(Command::Diagnostics).await
    }

    pub async fn set_event_sink(&self, sink: Arc<dyn EventSink>) -> Result<(), ClientError> {
        self.request(|reply| Command::SetEventSink(Some(sink), reply))
            .await
    }

    pub async fn clear_event_sink(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::SetEventSink(None, reply)).await
    }

    /// Store whose state is snapshotted and restored around updates
    pub async fn attach_state_store(&self, store: Arc<dyn StateStore>) -> Result<(), ClientError> {
        self.request(|reply| Command::AttachStateStore(Some(store), reply))
            .await
    }

    pub async fn detach_state_store(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::AttachStateStore(None, reply))
            .await
    }

    pub async fn create_snapshot(
        &self,
        source: SourceArtifact,
        live_state: BTreeMap<String, StateValue>,
    ) -> Result<StateSnapshot, ClientError> {
        self.request(|reply| Command::CreateSnapshot(source, live_state, reply))
            .await
    }

    pub async fn restore_state(
        &self,
        source: SourceArtifact,
        store: Arc<dyn StateStore>,
    ) -> Result<PreservationResult, ClientError> {
        self.request(|reply| Command::RestoreState(source, store, reply))
            .await
    }

    pub async fn should_preserve_state(
        &self,
        old: Option<SourceArtifact>,
        new: SourceArtifact,
    ) -> Result<bool, ClientError> {
        self.request(|reply| Command::ShouldPreserve(old, new, reply))
            .await
    }

    /// Drop snapshot history and every persisted record
    pub async fn clear_snapshots(&self) -> Result<usize, ClientError> {
        self.request(Command::ClearSnapshots).await
    }

    pub async fn snapshot_stats(&self) -> Result<SnapshotStats, ClientError> {
        self.request(Command::SnapshotStats).await
    }

    pub async fn export_diagnostics(&self) -> Result<SnapshotDiagnostics, ClientError> {
        self.request(Command::ExportDiagnostics).await
    }

    /// Wait until every snapshot write queued so far has reached disk
    pub async fn flush_persistence(&self) -> Result<(), ClientError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .tx
            .send(WorkerEvent::Command(Command::FlushPersistence(done_tx)))
            .map_err(|_| ConnectionError::ClientShutdown)?;
        done_rx
            .await
            .map_err(|_| ClientError::from(StorageError::QueueClosed))
    }

    /// Stop the worker. Every later operation fails with a shutdown error.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Shutdown(Some(reply))).await
    }
}

pub struct LiveClientBuilder {
    options: ClientOptions,
    connector: Option<Arc<dyn Connector>>,
    reachability: Option<ReachabilityMonitor>,
    device: Option<Arc<dyn DeviceInfoProvider>>,
    sink: Option<Arc<dyn EventSink>>,
    state_store: Option<Arc<dyn StateStore>>,
}

impl LiveClientBuilder {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            connector: None,
            reachability: None,
            device: None,
            sink: None,
            state_store: None,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn reachability(mut self, monitor: ReachabilityMonitor) -> Self {
        self.reachability = Some(monitor);
        self
    }

    pub fn device_info(mut self, provider: Arc<dyn DeviceInfoProvider>) -> Self {
        self.device = Some(provider);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Load persisted snapshots and start the worker. Must run inside a
    /// tokio runtime.
    pub async fn build(self) -> Result<LiveClient, ClientError> {
        let options = self.options;
        let device = self
            .device
            .unwrap_or_else(|| Arc::new(SystemDeviceInfo::new(options.client_id.clone())))
            .device_info();
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(options.connect_timeout)));
        let reachability = self
            .reachability
            .unwrap_or_else(ReachabilityMonitor::always_available);

        let (tx, rx) = mpsc::unbounded_channel();

        let mut snapshots = StateSnapshotService::new(options.snapshots.clone(), device.clone());
        if options.snapshots.enabled && options.snapshots.persistence_enabled {
            let dir = match &options.snapshots.directory {
                Some(dir) => dir.clone(),
                None => default_snapshot_dir()?,
            };
            let store = SnapshotStore::new(dir);
            let loader = store.clone();
            let loaded = match tokio::task::spawn_blocking(move || loader.load_all()).await {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    warn!(error = %e, "Could not load persisted snapshots");
                    Vec::new()
                }
                Err(e) => {
                    warn!(error = %e, "Snapshot loader panicked");
                    Vec::new()
                }
            };

            let failures = tx.clone();
            let worker = PersistenceWorker::spawn(store, move |e| {
                let _ = failures.send(WorkerEvent::PersistenceFailed(e));
            });
            snapshots = snapshots.with_persistence(worker);
            snapshots.load_history(loaded, Utc::now());
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let inner = ClientInner {
            tx: tx.clone(),
            state_rx,
            client_id: options.client_id.clone(),
            platform: device.platform.clone(),
            device: device.clone(),
            endpoint: options.endpoint.clone(),
            client_name: options.client_name.clone(),
            headers: options.headers.clone(),
        };

        let worker = Worker {
            lifecycle: ConnectionLifecycle::new(options.reconnect.clone()),
            recovery: ErrorRecoveryEngine::new(options.recovery_config()),
            framed: FramedMessage::new(options.wire.clone()),
            reachability_rx: reachability.subscribe(),
            _reachability: reachability,
            snapshots,
            connector,
            device,
            sink: self.sink,
            state_store: self.state_store,
            session: None,
            connecting: None,
            generation: 0,
            heartbeat: ScheduledTask::new("heartbeat"),
            retry: ScheduledTask::new("recovery-retry"),
            pending_ping: None,
            registration: None,
            last_source: None,
            stats: ConnectionStats::default(),
            state_tx,
            published: ConnectionState::Disconnected,
            tx,
            options,
        };
        tokio::spawn(worker.run(rx));

        Ok(LiveClient {
            inner: Arc::new(inner),
        })
    }
}

/// Single owner of every piece of mutable client state
struct Worker {
    options: ClientOptions,
    device: DeviceInfo,
    connector: Arc<dyn Connector>,
    framed: FramedMessage,
    lifecycle: ConnectionLifecycle,
    recovery: ErrorRecoveryEngine,
    snapshots: StateSnapshotService,
    _reachability: ReachabilityMonitor,
    reachability_rx: watch::Receiver<NetworkPath>,
    sink: Option<Arc<dyn EventSink>>,
    state_store: Option<Arc<dyn StateStore>>,
    session: Option<TransportSession>,
    connecting: Option<JoinHandle<()>>,
    generation: u64,
    heartbeat: ScheduledTask,
    retry: ScheduledTask,
    pending_ping: Option<u64>,
    registration: Option<ClientRegistration>,
    last_source: Option<SourceArtifact>,
    stats: ConnectionStats,
    state_tx: watch::Sender<ConnectionState>,
    published: ConnectionState,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        info!(client_id = %self.options.client_id, endpoint = %self.options.endpoint, "Client worker started");
        let initial = *self.reachability_rx.borrow_and_update();
        self.recovery.update_reachability(initial);
        let mut reachability_open = true;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if let WorkerEvent::Command(Command::Shutdown(reply)) = event {
                        self.teardown().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    self.handle_event(event);
                }
                changed = self.reachability_rx.changed(), if reachability_open => {
                    match changed {
                        Ok(()) => {
                            let path = *self.reachability_rx.borrow_and_update();
                            self.on_reachability(path);
                        }
                        Err(_) => reachability_open = false,
                    }
                }
            }
            self.publish_state();
        }
        info!(client_id = %self.options.client_id, "Client worker stopped");
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Command(command) => self.handle_command(command),
            WorkerEvent::Opened { generation, result } => self.on_opened(generation, result),
            WorkerEvent::Session { generation, event } => {
                if self.session.as_ref().map(|s| s.generation()) != Some(generation) {
                    trace!(generation, "Ignoring event from a replaced session");
                    return;
                }
                match event {
                    SessionEvent::Inbound(envelope) => self.on_inbound(envelope),
                    SessionEvent::Failed(e) => self.handle_connection_error(e, "transport"),
                }
            }
            WorkerEvent::HeartbeatDue { token } => self.on_heartbeat(token),
            WorkerEvent::RetryDue { token, reconnect } => {
                if self.retry.complete(token) {
                    self.run_recovery(reconnect);
                }
            }
            WorkerEvent::PersistenceFailed(e) => self.snapshots.note_persistence_failure(&e),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.connect_manual();
                let _ = reply.send(());
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Send(envelope, reply) => {
                let result = self.send(&envelope);
                let _ = reply.send(result);
            }
            Command::Register(registration, reply) => {
                let _ = reply.send(self.register(registration));
            }
            Command::TriggerRecovery(reply) => {
                let decision = self.recovery.trigger_recovery();
                let reconnect = self.lifecycle.state() == ConnectionState::Disconnected
                    && !self.lifecycle.is_manual_disconnect();
                self.apply_decision(decision, reconnect);
                let _ = reply.send(decision);
            }
            Command::ClearError(reply) => {
                if self.recovery.clear_error() {
                    self.retry.cancel();
                    self.lifecycle.cancel_reconnect();
                }
                let _ = reply.send(());
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            Command::SetEventSink(sink, reply) => {
                self.sink = sink;
                let _ = reply.send(());
            }
            Command::AttachStateStore(store, reply) => {
                self.state_store = store;
                let _ = reply.send(());
            }
            Command::CreateSnapshot(source, live_state, reply) => {
                let _ = reply.send(self.snapshots.create_snapshot(&source, &live_state));
            }
            Command::RestoreState(source, store, reply) => {
                let _ = reply.send(self.snapshots.restore_state(&source, store.as_ref()));
            }
            Command::ShouldPreserve(old, new, reply) => {
                let _ = reply.send(self.snapshots.should_preserve_state(old.as_ref(), &new));
            }
            Command::ClearSnapshots(reply) => {
                let _ = reply.send(self.snapshots.clear_all());
            }
            Command::SnapshotStats(reply) => {
                let _ = reply.send(self.snapshots.stats());
            }
            Command::ExportDiagnostics(reply) => {
                let _ = reply.send(self.snapshots.export_diagnostics());
            }
            Command::FlushPersistence(done) => self.snapshots.flush_persistence(done),
            Command::Shutdown(_) => {}
        }
    }

    fn connect_manual(&mut self) {
        if !self.lifecycle.begin_connect(true) {
            debug!(state = %self.lifecycle.state(), "Connect ignored");
            return;
        }
        self.retry.cancel();
        self.recovery.clear_error();
        self.open_transport();
    }

    #[instrument(level = "debug", skip(self), fields(endpoint = %self.options.endpoint.authority()))]
    fn open_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.publish_state();

        let connector = self.connector.clone();
        let endpoint = self.options.endpoint.clone();
        let tx = self.tx.clone();
        if let Some(previous) = self.connecting.take() {
            previous.abort();
        }
        self.connecting = Some(tokio::spawn(async move {
            let result = connector.connect(&endpoint).await;
            let _ = tx.send(WorkerEvent::Opened { generation, result });
        }));
        debug!(generation, "Opening transport");
    }

    fn on_opened(&mut self, generation: u64, result: Result<BoxedStream, ConnectionError>) {
        if generation != self.generation || self.lifecycle.state() != ConnectionState::Connecting {
            trace!(generation, "Discarding stale transport open");
            return;
        }
        self.connecting = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.handle_connection_error(e, "connect");
                return;
            }
        };

        let tx = self.tx.clone();
        self.session = Some(TransportSession::start(
            stream,
            generation,
            self.framed.clone(),
            move |event| {
                let _ = tx.send(WorkerEvent::Session { generation, event });
            },
        ));
        self.lifecycle.on_open();
        self.stats.successful_connections += 1;
        self.stats.last_connected_at = Some(Utc::now());
        info!(generation, endpoint = %self.options.endpoint, "Connected");
        self.publish_state();
        self.notify(|sink| sink.on_connect());

        if let Some(registration) = self.registration.clone() {
            if let Err(e) = self.send_registration(&registration) {
                warn!(error = %e, "Failed to send registration");
            }
        }

        if self.options.heartbeat.enabled {
            let tx = self.tx.clone();
            self.pending_ping = None;
            self.heartbeat
                .schedule_repeating(self.options.heartbeat.interval, move |token| {
                    let _ = tx.send(WorkerEvent::HeartbeatDue { token });
                });
        } else {
            // without probes an established session is the only liveness signal
            self.lifecycle.on_liveness_ack();
            self.recovery.record_liveness_ack();
        }
    }

    fn disconnect(&mut self) {
        let was_connected = self.lifecycle.state() == ConnectionState::Connected;
        self.lifecycle.mark_manual_disconnect();
        self.retry.cancel();
        self.recovery.cancel_retry();
        self.close_transport();
        info!(client_id = %self.options.client_id, "Disconnected by request");
        self.publish_state();
        if was_connected {
            self.notify(|sink| sink.on_disconnect(&DisconnectReason::Manual));
        }
    }

    /// Stop timers and drop the current session or pending open
    fn close_transport(&mut self) {
        self.heartbeat.cancel();
        self.pending_ping = None;
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        // late events from what was just closed must not match
        self.generation += 1;
    }

    fn transmit(&mut self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let session = match &self.session {
            Some(session) if self.lifecycle.can_send() => session,
            _ => {
                return Err(ConnectionError::NotConnected {
                    state: self.lifecycle.state(),
                })
            }
        };
        let frame = self.framed.encode_frame(envelope)?;
        session.enqueue(frame)?;
        self.stats.messages_sent += 1;
        Ok(())
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        match self.transmit(envelope) {
            Ok(()) => Ok(()),
            Err(ConnectionError::WireProtocol(wire)) if wire.is_encode_failure() => {
                let error = ConnectionError::Internal {
                    reason: wire.to_string(),
                    recoverable: None,
                };
                self.record_error(&error, "send", false);
                Err(error.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn register(&mut self, registration: ClientRegistration) -> Result<(), ClientError> {
        self.registration = Some(registration.clone());
        if self.lifecycle.can_send() {
            self.send_registration(&registration)?;
        } else {
            debug!("Registration deferred until connected");
        }
        Ok(())
    }

    fn send_registration(&mut self, registration: &ClientRegistration) -> Result<(), ClientError> {
        let envelope = Envelope::new_register(
            &self.options.client_id,
            &self.device.platform,
            registration,
        )?;
        self.transmit(&envelope)?;
        debug!(client_name = %registration.client_name, "Sent client registration");
        Ok(())
    }

    fn on_inbound(&mut self, envelope: Envelope) {
        self.stats.messages_received += 1;
        match envelope.kind() {
            Some(MessageKind::Ping) => match envelope.nonce() {
                Some(nonce) => {
                    let pong =
                        Envelope::new_pong(&self.options.client_id, &self.device.platform, nonce);
                    if let Err(e) = self.transmit(&pong) {
                        warn!(error = %e, nonce, "Failed to answer ping");
                    }
                }
                None => warn!("Ping without nonce ignored"),
            },
            Some(MessageKind::Pong) => self.on_pong(envelope.nonce()),
            Some(MessageKind::Error) => self.on_server_error(&envelope),
            Some(MessageKind::Update) => {
                self.on_update(&envelope);
                self.notify(|sink| sink.on_message(&envelope));
            }
            Some(MessageKind::ClientRegister) | None => {
                self.notify(|sink| sink.on_message(&envelope));
            }
        }
    }

    fn on_pong(&mut self, nonce: Option<u64>) {
        if nonce.is_none() || nonce != self.pending_ping {
            trace!(?nonce, expected = ?self.pending_ping, "Unmatched pong");
            return;
        }
        self.pending_ping = None;
        self.stats.heartbeats_acknowledged += 1;
        self.lifecycle.on_liveness_ack();
        self.recovery.record_liveness_ack();
    }

    fn on_heartbeat(&mut self, token: u64) {
        if !self.heartbeat.is_current(token) {
            return;
        }
        if let Some(nonce) = self.pending_ping {
            warn!(nonce, "Heartbeat not acknowledged in time");
            self.handle_connection_error(ConnectionError::LivenessTimeout { nonce }, "heartbeat");
            return;
        }

        let nonce: u64 = rand::random();
        let ping = Envelope::new_ping(&self.options.client_id, &self.device.platform, nonce);
        match self.transmit(&ping) {
            Ok(()) => {
                self.pending_ping = Some(nonce);
                self.stats.heartbeats_sent += 1;
                trace!(nonce, "Heartbeat sent");
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat could not be queued");
                self.handle_connection_error(ConnectionError::LivenessTimeout { nonce }, "heartbeat");
            }
        }
    }

    /// A server-reported error: recorded, but the connection stays up
    fn on_server_error(&mut self, envelope: &Envelope) {
        let payload = envelope
            .parse_payload::<ServerErrorPayload>()
            .unwrap_or_else(|_| ServerErrorPayload {
                code: None,
                message: envelope.payload.to_string(),
                recoverable: None,
            });
        let error = ConnectionError::Server {
            code: payload.code,
            message: payload.message,
            recoverable: payload.recoverable,
        };
        self.record_error(&error, "server", false);
    }

    fn on_update(&mut self, envelope: &Envelope) {
        let update = match envelope.parse_payload::<UpdatePayload>() {
            Ok(update) => update,
            Err(e) => {
                let error = ConnectionError::InvalidPayload {
                    reason: format!("update: {}", e),
                };
                self.record_error(&error, "update", false);
                return;
            }
        };

        let source = update.source;
        let previous = self.last_source.take();
        if let Some(store) = self.state_store.clone() {
            if let Some(previous) = &previous {
                self.snapshots.create_snapshot(previous, &store.entries());
            }
            if self.snapshots.should_preserve_state(previous.as_ref(), &source) {
                let result = self.snapshots.restore_state(&source, store.as_ref());
                self.notify(|sink| sink.on_state_restored(&source, &result));
            }
        }
        debug!(source = %source.descriptor.name, revision = %source.descriptor.revision, "Update received");
        self.last_source = Some(source);
    }

    /// The single path every transport-level failure goes through
    fn handle_connection_error(&mut self, error: ConnectionError, operation: &str) {
        let was_connected = self.lifecycle.state() == ConnectionState::Connected;
        self.close_transport();
        self.lifecycle.on_failure();
        self.publish_state();
        if was_connected {
            let reason = DisconnectReason::Error(error.to_string());
            self.notify(|sink| sink.on_disconnect(&reason));
        }
        self.record_error(&error, operation, true);
    }

    fn record_error(&mut self, error: &ConnectionError, operation: &str, transport: bool) {
        let context = ErrorContext::new(operation, self.lifecycle.attempts());
        let (record, decision) = self.recovery.handle_error(error, context);
        self.emit_error(&record);

        if transport {
            self.apply_transport_decision(decision);
        } else {
            let reconnect = self.lifecycle.state() == ConnectionState::Disconnected
                && !self.lifecycle.is_manual_disconnect()
                && self.lifecycle.policy().auto_reconnect;
            self.apply_decision(decision, reconnect);
        }
    }

    fn emit_error(&self, record: &ErrorRecord) {
        let presentation = ErrorPresentation::for_record(record);
        self.notify(|sink| sink.on_error(record, &presentation));
    }

    /// Turn a recovery decision for a dropped connection into a reconnect
    fn apply_transport_decision(&mut self, decision: RecoveryDecision) {
        let delay = match decision {
            RecoveryDecision::Retry { delay, .. } => Some(delay),
            // auto-recovery off: reconnect still follows the lifecycle backoff
            RecoveryDecision::Deferred => None,
            other => {
                self.apply_decision(other, false);
                return;
            }
        };

        match self.lifecycle.plan_reconnect(delay) {
            ReconnectDecision::Schedule { attempt, delay } => {
                self.stats.reconnects_scheduled += 1;
                info!(attempt, ?delay, "Reconnect scheduled");
                self.arm_retry(delay, true);
            }
            ReconnectDecision::Suppressed => {
                debug!("Reconnect suppressed");
                self.recovery.cancel_retry();
            }
            ReconnectDecision::Disabled => match delay {
                Some(delay) => self.arm_retry(delay, false),
                None => debug!("Auto-recovery and auto-reconnect disabled"),
            },
            ReconnectDecision::Exhausted { attempts } => {
                warn!(attempts, "Reconnect attempts exhausted; call connect() to retry");
                self.recovery.cancel_retry();
            }
        }
        self.publish_state();
    }

    fn apply_decision(&mut self, decision: RecoveryDecision, reconnect: bool) {
        match decision {
            RecoveryDecision::Retry { delay, .. } => {
                if reconnect {
                    // manual triggers may exceed the cap; begin_connect still accepts
                    if let ReconnectDecision::Schedule { .. } =
                        self.lifecycle.plan_reconnect(Some(delay))
                    {
                        self.stats.reconnects_scheduled += 1;
                    }
                }
                self.arm_retry(delay, reconnect);
            }
            RecoveryDecision::WaitForNetwork => {
                info!("Waiting for the network before recovering");
            }
            RecoveryDecision::Exhausted { attempts } => {
                warn!(attempts, "Recovery attempts exhausted");
                self.lifecycle.cancel_reconnect();
            }
            RecoveryDecision::NotRecoverable => {
                debug!("Error is not recoverable; no retry scheduled");
            }
            RecoveryDecision::Deferred => {
                debug!("Auto-recovery disabled; waiting for a manual trigger");
            }
            RecoveryDecision::NoError => {}
        }
    }

    fn arm_retry(&mut self, delay: Duration, reconnect: bool) {
        let tx = self.tx.clone();
        self.retry.schedule_once(delay, move |token| {
            let _ = tx.send(WorkerEvent::RetryDue { token, reconnect });
        });
    }

    /// A retry came due: tell the consumer and, for connection errors, reconnect
    fn run_recovery(&mut self, reconnect: bool) {
        if let Some(kind) = self.recovery.on_retry_fired() {
            debug!(%kind, reconnect, "Running recovery");
            self.notify(|sink| sink.on_recovery_retry(kind));
        }
        if reconnect && self.lifecycle.begin_connect(false) {
            self.open_transport();
        }
    }

    fn on_reachability(&mut self, path: NetworkPath) {
        if !self.recovery.update_reachability(path) {
            return;
        }
        // network is back while waiting on it: recover now, no backoff
        self.retry.cancel();
        let reconnect = self.lifecycle.state() == ConnectionState::Disconnected
            && !self.lifecycle.is_manual_disconnect()
            && self.lifecycle.policy().auto_reconnect
            && matches!(
                self.lifecycle.plan_reconnect(Some(Duration::ZERO)),
                ReconnectDecision::Schedule { .. }
            );
        if reconnect {
            self.stats.reconnects_scheduled += 1;
        }
        self.run_recovery(reconnect);
    }

    fn notify(&self, f: impl FnOnce(&dyn EventSink)) {
        if let Some(sink) = &self.sink {
            f(sink.as_ref());
        }
    }

    fn publish_state(&mut self) {
        let state = self.lifecycle.state();
        if state == self.published {
            return;
        }
        self.published = state;
        self.state_tx.send_replace(state);
        self.notify(|sink| sink.on_state_change(state));
    }

    fn diagnostics(&self) -> ClientDiagnostics {
        ClientDiagnostics {
            client_id: self.options.client_id.clone(),
            endpoint: self.options.endpoint.url(),
            state: self.lifecycle.state(),
            reconnect_attempts: self.lifecycle.attempts(),
            manual_disconnect: self.lifecycle.is_manual_disconnect(),
            heartbeat_pending: self.pending_ping.is_some(),
            connection: self.stats.clone(),
            recovery: self.recovery.diagnostics(),
            snapshots: self.snapshots.stats(),
        }
    }

    async fn teardown(&mut self) {
        self.retry.cancel();
        let was_connected = self.lifecycle.state() == ConnectionState::Connected;
        self.close_transport();
        self.lifecycle.terminate();
        self.publish_state();
        if was_connected {
            self.notify(|sink| sink.on_disconnect(&DisconnectReason::Manual));
        }
        self.snapshots.shutdown().await;
        if self.recovery.current_error().is_some() {
            debug!(
                kind = ?self.recovery.current_error().map(|r| r.kind),
                "Shutting down with an unresolved error"
            );
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.lifecycle.state() != ConnectionState::ErrorTerminal {
            error!(client_id = %self.options.client_id, "Client worker dropped without shutdown");
            self.state_tx.send_replace(ConnectionState::ErrorTerminal);
        }
    }
}
