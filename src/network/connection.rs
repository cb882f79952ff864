use crate::messages::{Envelope, FramedMessage, WireProtocolError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::lifecycle::ConnectionState;

/// Anything a session can run over: TCP in production, in-memory duplex
/// pipes in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport and link-level failures
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("Timed out connecting to {endpoint} after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Wire protocol error: {0}")]
    WireProtocol(#[from] WireProtocolError),

    #[error("Heartbeat {nonce} was not acknowledged")]
    LivenessTimeout { nonce: u64 },

    #[error("Link is not viable: {reason}")]
    LinkNotViable { reason: String },

    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("Server error{}: {message}", .code.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
    Server {
        code: Option<String>,
        message: String,
        recoverable: Option<bool>,
    },

    #[error("Internal error: {reason}")]
    Internal {
        reason: String,
        recoverable: Option<bool>,
    },

    #[error("Client has shut down")]
    ClientShutdown,

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_string(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_query(mut self, query: BTreeMap<String, String>) -> Self {
        self.query = query;
        self
    }

    /// `host:port`, as handed to the socket layer
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full URL form carried in the handshake
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let mut url = format!("livelink://{}{}", self.authority(), path);
        if !self.query.is_empty() {
            let query: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Opens byte streams to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, ConnectionError>;
}

/// Plain TCP connector with a bounded connect time
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(level = "debug", skip(self), fields(endpoint = %endpoint.authority()))]
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, ConnectionError> {
        let authority = endpoint.authority();
        let stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&authority)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    debug!(error = %source, "TCP connect failed");
                    return Err(ConnectionError::ConnectFailed {
                        endpoint: authority,
                        source,
                    });
                }
                Err(_) => {
                    return Err(ConnectionError::ConnectTimeout {
                        endpoint: authority,
                        timeout: self.connect_timeout,
                    })
                }
            };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }
        info!("Opened TCP stream to {}", authority);
        Ok(Box::new(stream))
    }
}

/// What a running session reports back to its owner
#[derive(Debug)]
pub enum SessionEvent {
    Inbound(Envelope),
    Failed(ConnectionError),
}

/// One open transport: a reader task decoding frames and a writer task
/// draining the outbound queue. Both report through the same callback.
pub struct TransportSession {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TransportSession {
    pub fn start<F>(stream: BoxedStream, generation: u64, framed: FramedMessage, on_event: F) -> Self
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let on_event = std::sync::Arc::new(on_event);
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader_framed = framed.clone();
        let reader_events = on_event.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader_framed.read_message(&mut read_half).await {
                    Ok(envelope) => {
                        trace!(generation, message_type = %envelope.message_type, "Inbound frame");
                        reader_events(SessionEvent::Inbound(envelope));
                    }
                    Err(WireProtocolError::Closed) => {
                        debug!(generation, "Transport closed by peer");
                        reader_events(SessionEvent::Failed(ConnectionError::ConnectionClosed));
                        break;
                    }
                    Err(e) => {
                        warn!(generation, error = %e, "Transport read failed");
                        reader_events(SessionEvent::Failed(e.into()));
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = framed.write_frame(&mut write_half, &frame).await {
                    warn!(generation, error = %e, "Transport write failed");
                    on_event(SessionEvent::Failed(e.into()));
                    return;
                }
            }
            let _ = write_half.shutdown().await;
            debug!(generation, "Writer drained and shut down");
        });

        Self {
            generation,
            outbound: Some(outbound_tx),
            reader,
            writer,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a pre-encoded frame behind whatever is already waiting
    pub fn enqueue(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        match &self.outbound {
            Some(tx) => tx.send(frame).map_err(|_| ConnectionError::ConnectionClosed),
            None => Err(ConnectionError::ConnectionClosed),
        }
    }

    /// Stop reading immediately; the writer flushes what is queued and
    /// then shuts the stream down.
    pub fn close(&mut self) {
        self.outbound.take();
        self.reader.abort();
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
        if !self.writer.is_finished() {
            // bounded by the write timeout inside write_frame
            trace!(generation = self.generation, "Session dropped with writer still draining");
        }
    }
}
