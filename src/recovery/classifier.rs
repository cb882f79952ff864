use crate::messages::WireProtocolError;
use crate::network::{ConnectionError, ReachabilityStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NetworkUnavailable,
    ServerUnreachable,
    Timeout,
    ConnectionFailed,
    ProtocolError,
    ServerError,
    InternalError,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    None,
    ImmediateRetry,
    ExponentialBackoff,
    WaitForNetwork,
}

/// Which layer a kind belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Connectivity,
    Protocol,
    Application,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::NetworkUnavailable,
        ErrorKind::ServerUnreachable,
        ErrorKind::Timeout,
        ErrorKind::ConnectionFailed,
        ErrorKind::ProtocolError,
        ErrorKind::ServerError,
        ErrorKind::InternalError,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkUnavailable => "network-unavailable",
            ErrorKind::ServerUnreachable => "server-unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionFailed => "connection-failed",
            ErrorKind::ProtocolError => "protocol-error",
            ErrorKind::ServerError => "server-error",
            ErrorKind::InternalError => "internal-error",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::NetworkUnavailable => Severity::Critical,
            ErrorKind::ServerUnreachable | ErrorKind::Timeout => Severity::High,
            ErrorKind::ConnectionFailed
            | ErrorKind::ProtocolError
            | ErrorKind::ServerError
            | ErrorKind::InternalError => Severity::Medium,
            ErrorKind::Unknown => Severity::Low,
        }
    }

    pub fn default_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::Unknown)
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorKind::NetworkUnavailable => RecoveryStrategy::WaitForNetwork,
            ErrorKind::Timeout => RecoveryStrategy::ImmediateRetry,
            ErrorKind::ServerUnreachable
            | ErrorKind::ConnectionFailed
            | ErrorKind::ProtocolError
            | ErrorKind::ServerError
            | ErrorKind::InternalError => RecoveryStrategy::ExponentialBackoff,
            ErrorKind::Unknown => RecoveryStrategy::None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::NetworkUnavailable
            | ErrorKind::ServerUnreachable
            | ErrorKind::Timeout
            | ErrorKind::ConnectionFailed => ErrorCategory::Connectivity,
            ErrorKind::ProtocolError => ErrorCategory::Protocol,
            ErrorKind::ServerError | ErrorKind::InternalError => ErrorCategory::Application,
            ErrorKind::Unknown => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// delay(n) = min(base × factorⁿ, max)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        Self { base, max, factor }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let exponent = failures.min(i32::MAX as u32) as i32;
        let ms = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if !ms.is_finite() || ms >= max_ms {
            return self.max;
        }
        Duration::from_millis(ms.round() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub attempt: u32,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>, attempt: u32) -> Self {
        Self {
            operation: operation.into(),
            attempt,
        }
    }
}

/// One classified failure. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub context: ErrorContext,
}

impl ErrorRecord {
    pub fn new(classification: Classification, message: String, context: ErrorContext) -> Self {
        Self {
            kind: classification.kind,
            severity: classification.kind.severity(),
            recoverable: classification.recoverable,
            message,
            timestamp: Utc::now(),
            context,
        }
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.kind.strategy()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub recoverable: bool,
}

impl Classification {
    fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            recoverable: kind.default_recoverable(),
        }
    }

    fn with_override(kind: ErrorKind, recoverable: Option<bool>) -> Self {
        Self {
            kind,
            recoverable: recoverable.unwrap_or_else(|| kind.default_recoverable()),
        }
    }
}

/// Map a transport or application failure onto the taxonomy
pub fn classify(error: &ConnectionError, reachability: ReachabilityStatus) -> Classification {
    match error {
        ConnectionError::Server {
            recoverable: nested,
            ..
        } => return Classification::with_override(ErrorKind::ServerError, *nested),
        ConnectionError::Internal {
            recoverable: nested,
            ..
        } => return Classification::with_override(ErrorKind::InternalError, *nested),
        ConnectionError::ClientShutdown => return Classification::of(ErrorKind::InternalError),
        _ => {}
    }

    if reachability == ReachabilityStatus::Unavailable {
        return Classification::of(ErrorKind::NetworkUnavailable);
    }

    let kind = match error {
        ConnectionError::ConnectFailed { .. } => ErrorKind::ServerUnreachable,
        ConnectionError::ConnectTimeout { .. } | ConnectionError::LivenessTimeout { .. } => {
            ErrorKind::Timeout
        }
        ConnectionError::WireProtocol(wire) => classify_wire(wire),
        ConnectionError::LinkNotViable { .. } | ConnectionError::InvalidPayload { .. } => {
            ErrorKind::ProtocolError
        }
        ConnectionError::ConnectionClosed | ConnectionError::NotConnected { .. } => {
            ErrorKind::ConnectionFailed
        }
        ConnectionError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
        ConnectionError::Io(_) => ErrorKind::ConnectionFailed,
        ConnectionError::Other(_) => ErrorKind::Unknown,
        ConnectionError::Server { .. }
        | ConnectionError::Internal { .. }
        | ConnectionError::ClientShutdown => ErrorKind::InternalError,
    };
    Classification::of(kind)
}

fn classify_wire(error: &WireProtocolError) -> ErrorKind {
    if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_protocol_violation() {
        ErrorKind::ProtocolError
    } else if error.is_encode_failure() {
        ErrorKind::InternalError
    } else {
        ErrorKind::ConnectionFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_kind_table() {
        let expected = [
            (ErrorKind::NetworkUnavailable, Severity::Critical, true),
            (ErrorKind::ServerUnreachable, Severity::High, true),
            (ErrorKind::Timeout, Severity::High, true),
            (ErrorKind::ConnectionFailed, Severity::Medium, true),
            (ErrorKind::ProtocolError, Severity::Medium, true),
            (ErrorKind::ServerError, Severity::Medium, true),
            (ErrorKind::InternalError, Severity::Medium, true),
            (ErrorKind::Unknown, Severity::Low, false),
        ];
        for (kind, severity, recoverable) in expected {
            assert_eq!(kind.severity(), severity, "{}", kind);
            assert_eq!(kind.default_recoverable(), recoverable, "{}", kind);
        }
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            ErrorKind::NetworkUnavailable.strategy(),
            RecoveryStrategy::WaitForNetwork
        );
        assert_eq!(ErrorKind::Timeout.strategy(), RecoveryStrategy::ImmediateRetry);
        assert_eq!(ErrorKind::Unknown.strategy(), RecoveryStrategy::None);
        for kind in [
            ErrorKind::ServerUnreachable,
            ErrorKind::ConnectionFailed,
            ErrorKind::ProtocolError,
            ErrorKind::ServerError,
            ErrorKind::InternalError,
        ] {
            assert_eq!(kind.strategy(), RecoveryStrategy::ExponentialBackoff);
        }
    }

    #[test]
    fn test_backoff_scenario() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
        let delays: Vec<u64> = (0..6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(150), Duration::from_secs(7), 1.7);
        let mut previous = Duration::ZERO;
        for n in 0..200 {
            let delay = policy.delay(n);
            assert!(delay >= previous, "delay({}) decreased", n);
            assert!(delay <= policy.max);
            previous = delay;
        }
        assert_eq!(policy.delay(u32::MAX), policy.max);
    }

    #[test]
    fn test_unavailable_network_wins_for_transport_errors() {
        let err = ConnectionError::ConnectionClosed;
        assert_eq!(
            classify(&err, ReachabilityStatus::Unavailable).kind,
            ErrorKind::NetworkUnavailable
        );
        assert_eq!(
            classify(&err, ReachabilityStatus::Available).kind,
            ErrorKind::ConnectionFailed
        );
    }

    #[test]
    fn test_transport_error_mapping() {
        let available = ReachabilityStatus::Available;
        let refused = ConnectionError::ConnectFailed {
            endpoint: "x:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(classify(&refused, available).kind, ErrorKind::ServerUnreachable);

        let liveness = ConnectionError::LivenessTimeout { nonce: 3 };
        assert_eq!(classify(&liveness, available).kind, ErrorKind::Timeout);

        let read_timeout = ConnectionError::WireProtocol(WireProtocolError::ReadTimeout {
            timeout: Duration::from_secs(1),
        });
        assert_eq!(classify(&read_timeout, available).kind, ErrorKind::Timeout);

        let corrupted = ConnectionError::WireProtocol(WireProtocolError::CorruptedData {
            reason: "bad".to_string(),
        });
        assert_eq!(classify(&corrupted, available).kind, ErrorKind::ProtocolError);

        let link = ConnectionError::LinkNotViable {
            reason: "x".to_string(),
        };
        assert_eq!(classify(&link, available).kind, ErrorKind::ProtocolError);

        let other = ConnectionError::Other("???".to_string());
        let classification = classify(&other, available);
        assert_eq!(classification.kind, ErrorKind::Unknown);
        assert!(!classification.recoverable);
    }

    #[test]
    fn test_nested_recoverable_overrides_default() {
        let server = ConnectionError::Server {
            code: None,
            message: "fatal".to_string(),
            recoverable: Some(false),
        };
        let classification = classify(&server, ReachabilityStatus::Unavailable);
        assert_eq!(classification.kind, ErrorKind::ServerError);
        assert!(!classification.recoverable);

        let internal = ConnectionError::Internal {
            reason: "oops".to_string(),
            recoverable: None,
        };
        assert!(classify(&internal, ReachabilityStatus::Available).recoverable);
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::NetworkUnavailable).unwrap();
        assert_eq!(json, "\"network-unavailable\"");
        for kind in ErrorKind::ALL {
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
    }
}
