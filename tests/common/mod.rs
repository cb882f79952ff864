//! Shared test utilities: a loopback framed server, scripted connectors
//! and event helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use livelink::messages::{DeviceInfo, Envelope, FramedMessage, WireConfig};
use livelink::network::{
    BoxedStream, ClientEvent, ClientOptions, ConnectionError, Connector, Endpoint,
    StaticDeviceInfo, TcpConnector,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const STEP: Duration = Duration::from_secs(3);

/// A server that speaks the length-prefixed envelope protocol
pub struct TestServer {
    listener: TcpListener,
    framed: FramedMessage,
}

impl TestServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        Self {
            listener,
            framed: FramedMessage::new(WireConfig::default()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("local addr")
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = timeout(STEP, self.listener.accept())
            .await
            .expect("client did not connect in time")
            .expect("accept");
        ServerConn {
            stream,
            framed: self.framed.clone(),
        }
    }

    /// Accept only if a client shows up within `wait`
    pub async fn try_accept(&self, wait: Duration) -> Option<ServerConn> {
        let (stream, _) = timeout(wait, self.listener.accept()).await.ok()?.ok()?;
        Some(ServerConn {
            stream,
            framed: self.framed.clone(),
        })
    }
}

/// One accepted client connection, seen from the server side
pub struct ServerConn {
    stream: TcpStream,
    framed: FramedMessage,
}

impl ServerConn {
    pub async fn send(&mut self, envelope: &Envelope) {
        self.framed
            .write_message(&mut self.stream, envelope)
            .await
            .expect("server write");
    }

    pub async fn recv(&mut self) -> Envelope {
        timeout(STEP, self.framed.read_message(&mut self.stream))
            .await
            .expect("no message from client in time")
            .expect("server read")
    }

    /// Next message of `message_type`, skipping anything else
    pub async fn recv_type(&mut self, message_type: &str) -> Envelope {
        loop {
            let envelope = self.recv().await;
            if envelope.message_type == message_type {
                return envelope;
            }
        }
    }

    /// True when the client closes its side within `wait`
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        matches!(
            timeout(wait, self.framed.read_message(&mut self.stream)).await,
            Ok(Err(_))
        )
    }
}

/// TCP connector that counts attempts and refuses while switched offline
pub struct SwitchableConnector {
    inner: TcpConnector,
    online: AtomicBool,
    calls: AtomicU32,
}

impl SwitchableConnector {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: TcpConnector::new(Duration::from_secs(2)),
            online: AtomicBool::new(online),
            calls: AtomicU32::new(0),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SwitchableConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, ConnectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectFailed {
                endpoint: endpoint.authority(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        self.inner.connect(endpoint).await
    }
}

/// Options for a loopback client with fast backoff and no persistence
pub fn test_options(port: u16) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.endpoint = Endpoint::new("127.0.0.1", port);
    options.client_id = "test-client".to_string();
    options.client_name = "integration".to_string();
    options.heartbeat.enabled = false;
    options.snapshots.persistence_enabled = false;
    options.reconnect.backoff.base = Duration::from_millis(20);
    options.reconnect.backoff.max = Duration::from_millis(100);
    options
}

pub fn test_device() -> Arc<StaticDeviceInfo> {
    Arc::new(StaticDeviceInfo(DeviceInfo {
        device_id: "device-1".to_string(),
        platform: "test".to_string(),
        model: None,
        os_version: None,
    }))
}

/// Wait for the first event matching `predicate`, dropping the rest
pub async fn wait_for_event<F>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut predicate: F,
) -> Option<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(STEP, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Everything already queued, without waiting
pub fn drain(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
