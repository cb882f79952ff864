//! Connection manager: transport sessions, the connection state machine,
//! scheduled heartbeat/retry timers, reachability, and the client worker
//! tying them together.

pub mod client;
pub mod connection;
pub mod events;
pub mod lifecycle;
pub mod reachability;
pub mod scheduler;

pub use client::{
    ClientDiagnostics, ClientError, ClientOptions, ConnectionStats, HeartbeatConfig, LiveClient,
    LiveClientBuilder,
};
pub use connection::{
    AsyncStream, BoxedStream, ConnectionError, Connector, Endpoint, SessionEvent, TcpConnector,
    TransportSession,
};
pub use events::{
    ChannelEventSink, ClientEvent, DeviceInfoProvider, DisconnectReason, EventSink,
    StaticDeviceInfo, SystemDeviceInfo,
};
pub use lifecycle::{ConnectionLifecycle, ConnectionState, ReconnectDecision, ReconnectPolicy};
pub use reachability::{
    ConnectionQuality, NetworkPath, ReachabilityHandle, ReachabilityMonitor, ReachabilityProbe,
    ReachabilityStatus, RouteProbe,
};
pub use scheduler::ScheduledTask;
