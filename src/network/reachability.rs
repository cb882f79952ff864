use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityStatus {
    Available,
    Unavailable,
}

impl fmt::Display for ReachabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReachabilityStatus::Available => write!(f, "available"),
            ReachabilityStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Coarse, advisory link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Unavailable,
    Poor,
    Fair,
    Good,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionQuality::Unavailable => "unavailable",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Good => "good",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of the OS network path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPath {
    pub status: ReachabilityStatus,
    /// Metered link (cellular, tethering)
    pub expensive: bool,
    /// Low-data mode or similar restriction
    pub constrained: bool,
}

impl NetworkPath {
    pub fn available() -> Self {
        Self {
            status: ReachabilityStatus::Available,
            expensive: false,
            constrained: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            status: ReachabilityStatus::Unavailable,
            expensive: false,
            constrained: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == ReachabilityStatus::Available
    }

    pub fn quality(&self) -> ConnectionQuality {
        match (self.status, self.expensive, self.constrained) {
            (ReachabilityStatus::Unavailable, _, _) => ConnectionQuality::Unavailable,
            (_, true, true) => ConnectionQuality::Poor,
            (_, true, false) | (_, false, true) => ConnectionQuality::Fair,
            _ => ConnectionQuality::Good,
        }
    }
}

/// Source of reachability readings. Called from a blocking thread.
pub trait ReachabilityProbe: Send + Sync + 'static {
    fn probe(&self) -> NetworkPath;
}

/// Checks whether the OS has a route to `target` by connecting an unbound
/// UDP socket. No packets leave the host.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    target: SocketAddr,
}

impl RouteProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl ReachabilityProbe for RouteProbe {
    fn probe(&self) -> NetworkPath {
        let bind_addr = if self.target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let routed = UdpSocket::bind(bind_addr).and_then(|socket| socket.connect(self.target));
        match routed {
            Ok(()) => NetworkPath::available(),
            Err(e) => {
                debug!(target = %self.target, error = %e, "No route to probe target");
                NetworkPath::unavailable()
            }
        }
    }
}

/// Publishes reachability transitions through a `watch` channel
pub struct ReachabilityMonitor {
    sender: Arc<watch::Sender<NetworkPath>>,
    poller: Option<JoinHandle<()>>,
}

impl ReachabilityMonitor {
    /// Poll `probe` every `interval` on a background task
    pub fn spawn(probe: Arc<dyn ReachabilityProbe>, interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(NetworkPath::available());
        let sender = Arc::new(tx);
        let handle = ReachabilityHandle {
            sender: sender.clone(),
        };

        let poller = tokio::spawn(async move {
            loop {
                let probe = probe.clone();
                match tokio::task::spawn_blocking(move || probe.probe()).await {
                    Ok(path) => {
                        handle.publish(path);
                    }
                    Err(e) => warn!(error = %e, "Reachability probe panicked"),
                }
                tokio::time::sleep(interval).await;
            }
        });

        Self {
            sender,
            poller: Some(poller),
        }
    }

    /// A monitor fed by the embedding application
    pub fn manual(initial: NetworkPath) -> (Self, ReachabilityHandle) {
        let (tx, _rx) = watch::channel(initial);
        let sender = Arc::new(tx);
        let handle = ReachabilityHandle {
            sender: sender.clone(),
        };
        (
            Self {
                sender,
                poller: None,
            },
            handle,
        )
    }

    /// A monitor that always reports an available path
    pub fn always_available() -> Self {
        Self::manual(NetworkPath::available()).0
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkPath> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> NetworkPath {
        *self.sender.borrow()
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

/// Write side of a manual monitor
#[derive(Clone)]
pub struct ReachabilityHandle {
    sender: Arc<watch::Sender<NetworkPath>>,
}

impl ReachabilityHandle {
    /// Publish `path`. Returns true when it differs from the last reading.
    pub fn publish(&self, path: NetworkPath) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current != path {
                *current = path;
                true
            } else {
                false
            }
        });
        if changed {
            info!(status = %path.status, quality = %path.quality(), "Network path changed");
        }
        changed
    }

    pub fn set_available(&self) -> bool {
        self.publish(NetworkPath::available())
    }

    pub fn set_unavailable(&self) -> bool {
        self.publish(NetworkPath::unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_quality_estimate() {
        let mut path = NetworkPath::available();
        assert_eq!(path.quality(), ConnectionQuality::Good);
        path.expensive = true;
        assert_eq!(path.quality(), ConnectionQuality::Fair);
        path.constrained = true;
        assert_eq!(path.quality(), ConnectionQuality::Poor);
        path.status = ReachabilityStatus::Unavailable;
        assert_eq!(path.quality(), ConnectionQuality::Unavailable);
    }

    #[tokio::test]
    async fn test_manual_monitor_publishes_only_transitions() {
        let (monitor, handle) = ReachabilityMonitor::manual(NetworkPath::available());
        let mut rx = monitor.subscribe();

        assert!(!handle.set_available());
        assert!(!rx.has_changed().unwrap());

        assert!(handle.set_unavailable());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().status, ReachabilityStatus::Unavailable);
        assert_eq!(monitor.current(), NetworkPath::unavailable());
    }

    struct ToggleProbe(AtomicBool);

    impl ReachabilityProbe for ToggleProbe {
        fn probe(&self) -> NetworkPath {
            if self.0.load(Ordering::SeqCst) {
                NetworkPath::available()
            } else {
                NetworkPath::unavailable()
            }
        }
    }

    #[tokio::test]
    async fn test_polling_monitor_follows_probe() {
        let probe = Arc::new(ToggleProbe(AtomicBool::new(false)));
        let monitor = ReachabilityMonitor::spawn(probe.clone(), Duration::from_millis(10));
        let mut rx = monitor.subscribe();

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!rx.borrow_and_update().is_available());

        probe.0.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.borrow_and_update().is_available());
    }

    #[test]
    fn test_route_probe_loopback_is_available() {
        let probe = RouteProbe::new("127.0.0.1:9".parse().unwrap());
        assert!(probe.probe().is_available());
    }
}
