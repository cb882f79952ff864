use crate::messages::{DeviceInfo, Envelope};
use crate::network::ConnectionState;
use crate::recovery::{ErrorKind, ErrorPresentation, ErrorRecord};
use crate::state::{PreservationResult, SourceArtifact};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Manual,
    Error(String),
}

/// Consumer callbacks. Every method defaults to a no-op so a sink only
/// implements what it cares about. Called from the client worker: keep
/// them short and non-blocking.
pub trait EventSink: Send + Sync {
    fn on_connect(&self) {}

    fn on_disconnect(&self, _reason: &DisconnectReason) {}

    fn on_message(&self, _message: &Envelope) {}

    fn on_error(&self, _record: &ErrorRecord, _presentation: &ErrorPresentation) {}

    /// State was carried over from an earlier snapshot before the update
    /// that triggered it is delivered through `on_message`.
    fn on_state_restored(&self, _source: &SourceArtifact, _result: &PreservationResult) {}

    /// A scheduled recovery fired; the consumer may retry its own operation
    fn on_recovery_retry(&self, _kind: ErrorKind) {}

    fn on_state_change(&self, _state: ConnectionState) {}
}

/// Everything an [`EventSink`] can observe, as an owned value
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected(DisconnectReason),
    Message(Envelope),
    Error {
        record: ErrorRecord,
        presentation: ErrorPresentation,
    },
    StateRestored {
        source: SourceArtifact,
        result: PreservationResult,
    },
    RecoveryRetry(ErrorKind),
    StateChanged(ConnectionState),
}

/// Forwards every callback into an unbounded channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ClientEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelEventSink {
    fn on_connect(&self) {
        self.forward(ClientEvent::Connected);
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        self.forward(ClientEvent::Disconnected(reason.clone()));
    }

    fn on_message(&self, message: &Envelope) {
        self.forward(ClientEvent::Message(message.clone()));
    }

    fn on_error(&self, record: &ErrorRecord, presentation: &ErrorPresentation) {
        self.forward(ClientEvent::Error {
            record: record.clone(),
            presentation: presentation.clone(),
        });
    }

    fn on_state_restored(&self, source: &SourceArtifact, result: &PreservationResult) {
        self.forward(ClientEvent::StateRestored {
            source: source.clone(),
            result: result.clone(),
        });
    }

    fn on_recovery_retry(&self, kind: ErrorKind) {
        self.forward(ClientEvent::RecoveryRetry(kind));
    }

    fn on_state_change(&self, state: ConnectionState) {
        self.forward(ClientEvent::StateChanged(state));
    }
}

/// Supplies the device facts sent in the handshake and stamped on snapshots
pub trait DeviceInfoProvider: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
}

/// Fixed device info, mostly for tests and embedding
#[derive(Debug, Clone)]
pub struct StaticDeviceInfo(pub DeviceInfo);

impl DeviceInfoProvider for StaticDeviceInfo {
    fn device_info(&self) -> DeviceInfo {
        self.0.clone()
    }
}

/// Device info derived from the host the binary runs on
#[derive(Debug, Clone)]
pub struct SystemDeviceInfo {
    device_id: String,
}

impl SystemDeviceInfo {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

impl DeviceInfoProvider for SystemDeviceInfo {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            platform: std::env::consts::OS.to_string(),
            model: Some(std::env::consts::ARCH.to_string()),
            os_version: None,
        }
    }
}
